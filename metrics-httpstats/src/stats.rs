use std::{sync::Arc, time::Duration};

use http::{Extensions, Request};
use metrics_rollup::{MetricSink, Tag};
use parking_lot::Mutex;

/// Request-scoped stats.
///
/// A `Stats` pairs a sink with a set of tags accumulated over the lifetime of a single request.
/// The server layer attaches one to every request it handles, seeded with the output of the
/// configured request taggers, so that handlers can emit their own metrics carrying the same
/// annotations:
///
/// ```
/// # use http::Request;
/// # use metrics_httpstats::Stats;
/// # use metrics_rollup::{MetricSink, Tag};
/// fn handle(req: &Request<()>) {
///     if let Some(stats) = Stats::from_request(req) {
///         stats.add_tags([Tag::new("cache", "miss")]);
///         stats.count("cache_lookups", 1, &[]);
///     }
/// }
/// ```
///
/// Every emission forwards the tags given at the call site followed by the accumulated tags.
pub struct Stats {
    sink: Arc<dyn MetricSink>,
    tags: Mutex<Vec<Tag>>,
}

impl Stats {
    /// Creates a new `Stats` without any tags.
    pub fn new(sink: Arc<dyn MetricSink>) -> Self {
        Self::with_tags(sink, Vec::new())
    }

    /// Creates a new `Stats` seeded with the given tags.
    pub fn with_tags(sink: Arc<dyn MetricSink>, tags: Vec<Tag>) -> Self {
        Stats { sink, tags: Mutex::new(tags) }
    }

    /// Appends tags to every subsequent emission.
    pub fn add_tags<I>(&self, tags: I)
    where
        I: IntoIterator<Item = Tag>,
    {
        self.tags.lock().extend(tags);
    }

    /// Returns a copy of the accumulated tags.
    pub fn tags(&self) -> Vec<Tag> {
        self.tags.lock().clone()
    }

    /// Gets the `Stats` attached to the given extensions, if any.
    pub fn from_extensions(extensions: &Extensions) -> Option<Arc<Stats>> {
        extensions.get::<Arc<Stats>>().cloned()
    }

    /// Gets the `Stats` attached to the given request, if any.
    pub fn from_request<B>(req: &Request<B>) -> Option<Arc<Stats>> {
        Self::from_extensions(req.extensions())
    }

    fn with_scoped_tags<F>(&self, tags: &[Tag], emit: F)
    where
        F: FnOnce(&[Tag]),
    {
        let mut combined = tags.to_vec();
        combined.extend(self.tags.lock().iter().cloned());
        emit(&combined);
    }
}

impl MetricSink for Stats {
    fn count(&self, name: &str, value: u64, tags: &[Tag]) {
        self.with_scoped_tags(tags, |tags| self.sink.count(name, value, tags));
    }

    fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        self.with_scoped_tags(tags, |tags| self.sink.gauge(name, value, tags));
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        self.with_scoped_tags(tags, |tags| self.sink.histogram(name, value, tags));
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        self.with_scoped_tags(tags, |tags| self.sink.timing(name, value, tags));
    }
}
