use std::time::Duration;

use metrics_util::layers::Layer;
use tracing::debug;

use crate::{rollup::compute_variants, sink::MetricSink, tag::Tag};

/// Fans distribution emissions out across every rollup granularity.
///
/// Histograms and timings are forwarded once per variant computed by
/// [`compute_variants`](crate::compute_variants), with the same name and value. Counters and gauges
/// aggregate correctly across hosts on their own, so they pass through once with their tags
/// unmodified.
///
/// With no rollup keys configured, histograms and timings also pass through unmodified.
pub struct Rollup<S> {
    keys: Vec<String>,
    inner: S,
}

impl<S> Rollup<S> {
    fn for_each_variant<F>(&self, tags: &[Tag], mut emit: F)
    where
        F: FnMut(&[Tag]),
    {
        if self.keys.is_empty() {
            return emit(tags);
        }

        for variant in compute_variants(tags, &self.keys) {
            emit(&variant);
        }
    }
}

impl<S: MetricSink> MetricSink for Rollup<S> {
    fn count(&self, name: &str, value: u64, tags: &[Tag]) {
        self.inner.count(name, value, tags);
    }

    fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        self.inner.gauge(name, value, tags);
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        self.for_each_variant(tags, |variant| self.inner.histogram(name, value, variant));
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        self.for_each_variant(tags, |variant| self.inner.timing(name, value, variant));
    }
}

/// A layer for rolling up distributions across global tag keys.
///
/// More information on the behavior of the layer can be found in [`Rollup`].
#[derive(Clone, Debug, Default)]
pub struct RollupLayer {
    keys: Vec<String>,
}

impl RollupLayer {
    /// Creates a new `RollupLayer` from the given keys, ordered coarsest first.
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        RollupLayer { keys: keys.into_iter().map(Into::into).collect() }
    }
}

impl<S> Layer<S> for RollupLayer {
    type Output = Rollup<S>;

    fn layer(&self, inner: S) -> Self::Output {
        if self.keys.is_empty() {
            debug!("No rollup keys configured. Distributions will pass through unmodified.");
        }
        Rollup { keys: self.keys.clone(), inner }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_util::layers::Layer;

    use super::RollupLayer;
    use crate::{
        debugging::{DebuggingSink, Emission},
        sink::MetricSink,
        tag::Tag,
    };

    fn tags(raw: &[&str]) -> Vec<Tag> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_counters_and_gauges_pass_through() {
        let debugging = DebuggingSink::new();
        let rollup = RollupLayer::new(["region", "host"]).layer(debugging.clone());
        let input = tags(&["region:us-west-2", "host:1234"]);

        rollup.count("requests", 3, &input);
        rollup.gauge("inflight", 7.0, &input);

        assert_eq!(
            debugging.emissions(),
            vec![
                Emission::Count { name: "requests".into(), value: 3, tags: input.clone() },
                Emission::Gauge { name: "inflight".into(), value: 7.0, tags: input },
            ]
        );
    }

    #[test]
    fn test_distributions_are_fanned_out() {
        let debugging = DebuggingSink::new();
        let rollup = RollupLayer::new(["region", "az", "host", "container"]).layer(debugging.clone());
        let input = tags(&["region:test", "az:test", "host:test", "extra:value"]);

        rollup.timing("stat", Duration::from_nanos(1), &input);
        rollup.histogram("stat", 1.0, &input);

        let emissions = debugging.emissions();
        assert_eq!(emissions.len(), 8);

        let expected = [
            tags(&["region:global", "az:global", "host:global", "extra:value", "container:global"]),
            tags(&["region:test", "az:global", "host:global", "extra:value", "container:global"]),
            tags(&["region:test", "az:test", "host:global", "extra:value", "container:global"]),
            tags(&["region:test", "az:test", "host:test", "extra:value", "container:global"]),
        ];
        for (emission, tags) in emissions[..4].iter().zip(&expected) {
            assert_eq!(
                emission,
                &Emission::Timing {
                    name: "stat".into(),
                    value: Duration::from_nanos(1),
                    tags: tags.clone()
                }
            );
        }
        for (emission, tags) in emissions[4..].iter().zip(&expected) {
            assert_eq!(
                emission,
                &Emission::Histogram { name: "stat".into(), value: 1.0, tags: tags.clone() }
            );
        }
    }

    #[test]
    fn test_no_keys_degrades_to_direct_emission() {
        let debugging = DebuggingSink::new();
        let rollup = RollupLayer::default().layer(debugging.clone());
        let input = tags(&["host:1234"]);

        rollup.histogram("bytes", 512.0, &input);

        assert_eq!(
            debugging.emissions(),
            vec![Emission::Histogram { name: "bytes".into(), value: 512.0, tags: input }]
        );
    }
}
