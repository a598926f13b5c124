use std::{sync::Arc, time::Duration};

use http::request::Parts;
use metrics::SharedString;
use metrics_exporter_dogstatsd::DogStatsDBuilder;
use metrics_rollup::{
    layers::{FanoutBuilder, RollupLayer, TagsLayer},
    MetricSink, NoopSink, RecorderSink, Tag,
};
use metrics_util::layers::{Layer, PrefixLayer};
use quanta::Clock;
use thiserror::Error;
use tracing::debug;

/// Errors that could occur while configuring the instrumentation layers.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to build a DogStatsD exporter, such as when the remote address is invalid.
    #[error("failed to build DogStatsD sink: {0}")]
    DogStatsD(#[from] metrics_exporter_dogstatsd::BuildError),
}

/// Derives a tag from an incoming or outgoing request.
pub(crate) type RequestTagger = Arc<dyn Fn(&Parts) -> Tag + Send + Sync>;

/// Configuration shared by the server and client builders.
#[derive(Clone, Default)]
pub(crate) struct CommonConfig {
    pub tags: Vec<Tag>,
    pub taggers: Vec<RequestTagger>,
    pub sinks: Vec<Arc<dyn MetricSink>>,
    pub clock: Clock,
}

impl CommonConfig {
    pub fn add_tag<K, V>(&mut self, key: K, value: V)
    where
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        self.tags.push(Tag::new(key, value));
    }

    pub fn add_tagger<F, K, V>(&mut self, tagger: F)
    where
        F: Fn(&Parts) -> (K, V) + Send + Sync + 'static,
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        self.taggers.push(Arc::new(move |parts| {
            let (key, value) = tagger(parts);
            Tag::new(key, value)
        }));
    }

    pub fn add_rollup_sink<I, K>(&mut self, sink: Arc<dyn MetricSink>, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.sinks.push(Arc::new(RollupLayer::new(keys).layer(sink)));
    }

    /// Combines every configured sink into one.
    ///
    /// With nothing configured, emissions are discarded.
    pub fn terminal_sink(&self) -> Arc<dyn MetricSink> {
        match self.sinks.as_slice() {
            [] => Arc::new(NoopSink),
            [sink] => Arc::clone(sink),
            sinks => Arc::new(
                sinks
                    .iter()
                    .cloned()
                    .fold(FanoutBuilder::default(), FanoutBuilder::add_shared_sink)
                    .build(),
            ),
        }
    }

    /// Combines every configured sink into one, applying the static tags.
    pub fn tagged_sink(&self) -> Arc<dyn MetricSink> {
        Arc::new(TagsLayer::new(self.tags.iter().cloned()).layer(self.terminal_sink()))
    }
}

pub(crate) fn run_taggers(taggers: &[RequestTagger], parts: &Parts) -> Vec<Tag> {
    taggers.iter().map(|tagger| tagger(parts)).collect()
}

/// Where and how to forward metrics to a DogStatsD server.
///
/// Anything left unset keeps the exporter's default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DogStatsDOptions {
    remote_addr: String,
    prefix: String,
    max_payload_len: Option<usize>,
    flush_interval: Option<Duration>,
}

impl DogStatsDOptions {
    /// Creates options for sending to `remote_addr`, such as `127.0.0.1:8125` or `udp://host:8125`.
    pub fn new<A: Into<String>>(remote_addr: A) -> Self {
        DogStatsDOptions { remote_addr: remote_addr.into(), ..Default::default() }
    }

    /// Sets a prefix prepended to every metric name as `<prefix>.<name>`.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the maximum size of a single payload sent to the server.
    ///
    /// This should be no larger than the agent's `dogstatsd_buffer_size`.
    #[must_use]
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = Some(max_payload_len);
        self
    }

    /// Sets how often aggregated metrics are flushed to the server.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = Some(flush_interval);
        self
    }
}

/// Builds a sink forwarding to a DogStatsD server.
pub(crate) fn dogstatsd_sink(options: &DogStatsDOptions) -> Result<Arc<dyn MetricSink>, BuildError> {
    let mut builder = DogStatsDBuilder::default().with_remote_address(&options.remote_addr)?;
    if let Some(max_payload_len) = options.max_payload_len {
        builder = builder.with_maximum_payload_length(max_payload_len)?;
    }
    if let Some(flush_interval) = options.flush_interval {
        builder = builder.with_flush_interval(flush_interval);
    }

    let recorder = builder.build()?;
    debug!(
        remote_addr = %options.remote_addr,
        prefix = %options.prefix,
        max_payload_len = ?options.max_payload_len,
        flush_interval = ?options.flush_interval,
        "Built DogStatsD sink."
    );

    if options.prefix.is_empty() {
        Ok(Arc::new(RecorderSink::new(recorder)))
    } else {
        Ok(Arc::new(RecorderSink::new(PrefixLayer::new(options.prefix.clone()).layer(recorder))))
    }
}
