use std::time::Duration;

use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit,
};

use crate::{sink::MetricSink, tag::Tag};

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Forwards emissions to a [`metrics`] recorder.
///
/// Tags become labels, in order. Counts increment a counter, gauges are set absolutely, and both
/// histograms and timings are recorded into a histogram.
///
/// Timings are recorded in seconds, following the `metrics` convention for durations. A 250ms timing
/// is recorded as `0.25`, and reaches DogStatsD as a histogram sample rather than a `|ms` timer, so
/// dashboards built on millisecond timers need rescaling.
///
/// This is the bridge to every exporter in the `metrics` ecosystem: wrap a DogStatsD or Prometheus
/// recorder, or use [`RecorderSink::global`] to target whichever recorder is installed globally.
#[derive(Clone, Debug, Default)]
pub struct RecorderSink<R> {
    recorder: R,
}

impl<R> RecorderSink<R> {
    /// Creates a new `RecorderSink` wrapping the given recorder.
    pub fn new(recorder: R) -> Self {
        RecorderSink { recorder }
    }
}

impl RecorderSink<GlobalRecorder> {
    /// Creates a `RecorderSink` that forwards to the globally installed recorder.
    pub fn global() -> Self {
        RecorderSink::new(GlobalRecorder)
    }
}

fn key_for(name: &str, tags: &[Tag]) -> Key {
    Key::from_parts(name.to_owned(), tags.iter().map(Label::from).collect::<Vec<_>>())
}

impl<R: Recorder + Send + Sync> MetricSink for RecorderSink<R> {
    fn count(&self, name: &str, value: u64, tags: &[Tag]) {
        self.recorder.register_counter(&key_for(name, tags), &METADATA).increment(value);
    }

    fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        self.recorder.register_gauge(&key_for(name, tags), &METADATA).set(value);
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        self.recorder.register_histogram(&key_for(name, tags), &METADATA).record(value);
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        self.recorder.register_histogram(&key_for(name, tags), &METADATA).record(value.as_secs_f64());
    }
}

/// A [`Recorder`] that delegates to the globally installed recorder at call time.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalRecorder;

impl Recorder for GlobalRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        metrics::with_recorder(|recorder| recorder.describe_counter(key, unit, description));
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        metrics::with_recorder(|recorder| recorder.describe_gauge(key, unit, description));
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        metrics::with_recorder(|recorder| recorder.describe_histogram(key, unit, description));
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> Counter {
        metrics::with_recorder(|recorder| recorder.register_counter(key, metadata))
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> Gauge {
        metrics::with_recorder(|recorder| recorder.register_gauge(key, metadata))
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> Histogram {
        metrics::with_recorder(|recorder| recorder.register_histogram(key, metadata))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics::Label;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::{GlobalRecorder, RecorderSink};
    use crate::{sink::MetricSink, tag::Tag};

    #[test]
    fn test_emissions_become_recorder_operations() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let sink = RecorderSink::new(recorder);
        let tags = [Tag::new("method", "GET"), Tag::new("status", "ok")];

        sink.count("requests", 2, &tags);
        sink.count("requests", 3, &tags);
        sink.histogram("bytes", 128.0, &tags);
        sink.timing("latency", Duration::from_millis(250), &tags);

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(snapshot.len(), 3);

        for (key, _, _, value) in snapshot {
            let labels = key.key().labels().cloned().collect::<Vec<_>>();
            assert_eq!(labels, vec![Label::new("method", "GET"), Label::new("status", "ok")]);

            match key.key().name() {
                "requests" => assert_eq!(value, DebugValue::Counter(5)),
                "bytes" => assert_eq!(value, DebugValue::Histogram(vec![128.0.into()])),
                "latency" => assert_eq!(value, DebugValue::Histogram(vec![0.25.into()])),
                other => panic!("unexpected metric {other}"),
            }
        }
    }

    #[test]
    fn test_global_sink_uses_installed_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let sink: RecorderSink<GlobalRecorder> = RecorderSink::global();

        metrics::with_local_recorder(&recorder, || {
            sink.count("requests", 1, &[Tag::new("host", "global")]);
            sink.timing("latency", Duration::from_millis(40), &[]);
        });

        let mut snapshot = snapshotter.snapshot().into_vec();
        snapshot.sort_by(|a, b| a.0.key().name().cmp(b.0.key().name()));
        assert_eq!(snapshot.len(), 2);

        let (key, _, _, value) = &snapshot[0];
        assert_eq!(key.key().name(), "latency");
        assert_eq!(value, &DebugValue::Histogram(vec![0.04.into()]));

        let (key, _, _, value) = &snapshot[1];
        assert_eq!(key.key().labels().cloned().collect::<Vec<_>>(), vec![Label::new("host", "global")]);
        assert_eq!(value, &DebugValue::Counter(1));
    }
}
