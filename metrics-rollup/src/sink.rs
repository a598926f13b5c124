use std::{sync::Arc, time::Duration};

use crate::tag::Tag;

/// A consumer of tagged metric emissions.
///
/// Sinks are shared between every in-flight request, so implementations must be safe for
/// concurrent use. Emissions are fire-and-forget: a sink must not block the caller indefinitely and
/// has no way to report failure back to it.
pub trait MetricSink: Send + Sync {
    /// Increments a counter.
    fn count(&self, name: &str, value: u64, tags: &[Tag]);

    /// Sets a gauge.
    fn gauge(&self, name: &str, value: f64, tags: &[Tag]);

    /// Records a value in a distribution.
    fn histogram(&self, name: &str, value: f64, tags: &[Tag]);

    /// Records a duration in a distribution.
    fn timing(&self, name: &str, value: Duration, tags: &[Tag]);
}

macro_rules! impl_sink_for_pointer {
    ($($ptr:ty),+) => {
        $(
            impl<T> MetricSink for $ptr
            where
                T: MetricSink + ?Sized,
            {
                fn count(&self, name: &str, value: u64, tags: &[Tag]) {
                    (**self).count(name, value, tags)
                }

                fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
                    (**self).gauge(name, value, tags)
                }

                fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
                    (**self).histogram(name, value, tags)
                }

                fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
                    (**self).timing(name, value, tags)
                }
            }
        )+
    };
}

impl_sink_for_pointer!(&T, Box<T>, Arc<T>);

/// A sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn count(&self, _name: &str, _value: u64, _tags: &[Tag]) {}
    fn gauge(&self, _name: &str, _value: f64, _tags: &[Tag]) {}
    fn histogram(&self, _name: &str, _value: f64, _tags: &[Tag]) {}
    fn timing(&self, _name: &str, _value: Duration, _tags: &[Tag]) {}
}
