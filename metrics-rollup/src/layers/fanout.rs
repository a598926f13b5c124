use std::{sync::Arc, time::Duration};

use crate::{sink::MetricSink, tag::Tag};

/// Fans out emissions to multiple sinks.
///
/// Sinks are called in the order they were added.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn MetricSink>>,
}

impl Fanout {
    /// Number of sinks emissions are forwarded to.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns `true` if there are no sinks to forward to.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricSink for Fanout {
    fn count(&self, name: &str, value: u64, tags: &[Tag]) {
        for sink in &self.sinks {
            sink.count(name, value, tags);
        }
    }

    fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        for sink in &self.sinks {
            sink.gauge(name, value, tags);
        }
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        for sink in &self.sinks {
            sink.histogram(name, value, tags);
        }
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        for sink in &self.sinks {
            sink.timing(name, value, tags);
        }
    }
}

/// Builder for [`Fanout`].
#[derive(Default)]
pub struct FanoutBuilder {
    sinks: Vec<Arc<dyn MetricSink>>,
}

impl FanoutBuilder {
    /// Adds a sink to the fanout list.
    pub fn add_sink<S>(self, sink: S) -> FanoutBuilder
    where
        S: MetricSink + 'static,
    {
        self.add_shared_sink(Arc::new(sink))
    }

    /// Adds an already shared sink to the fanout list.
    pub fn add_shared_sink(mut self, sink: Arc<dyn MetricSink>) -> FanoutBuilder {
        self.sinks.push(sink);
        self
    }

    /// Builds the `Fanout`.
    pub fn build(self) -> Fanout {
        Fanout { sinks: self.sinks }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::FanoutBuilder;
    use crate::{debugging::DebuggingSink, sink::MetricSink, tag::Tag};

    #[test]
    fn test_basic_functionality() {
        let sink1 = DebuggingSink::new();
        let sink2 = DebuggingSink::new();
        let fanout = FanoutBuilder::default().add_sink(sink1.clone()).add_sink(sink2.clone()).build();
        assert_eq!(fanout.len(), 2);

        let tags = [Tag::new("service", "search")];
        fanout.count("tokio.loops", 47, &tags);
        fanout.gauge("hyper.sent.bytes", 12.0, &tags);
        fanout.histogram("hyper.body.bytes", 1024.0, &tags);
        fanout.timing("hyper.latency", Duration::from_millis(3), &tags);

        let after1 = sink1.emissions();
        let after2 = sink2.emissions();
        assert_eq!(after1.len(), 4);
        assert_eq!(after1, after2);
    }

    #[test]
    fn test_empty_fanout_discards() {
        let fanout = FanoutBuilder::default().build();
        assert!(fanout.is_empty());
        fanout.count("dropped", 1, &[]);
    }
}
