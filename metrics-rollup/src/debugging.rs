//! Tools for inspecting emissions in tests.
use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{sink::MetricSink, tag::Tag};

/// A single call made against a [`DebuggingSink`].
#[derive(Clone, Debug, PartialEq)]
pub enum Emission {
    /// Counter increment.
    Count {
        /// Metric name.
        name: String,
        /// Increment.
        value: u64,
        /// Tags, in the order given.
        tags: Vec<Tag>,
    },
    /// Gauge update.
    Gauge {
        /// Metric name.
        name: String,
        /// Absolute value.
        value: f64,
        /// Tags, in the order given.
        tags: Vec<Tag>,
    },
    /// Histogram sample.
    Histogram {
        /// Metric name.
        name: String,
        /// Sample.
        value: f64,
        /// Tags, in the order given.
        tags: Vec<Tag>,
    },
    /// Timing sample.
    Timing {
        /// Metric name.
        name: String,
        /// Duration.
        value: Duration,
        /// Tags, in the order given.
        tags: Vec<Tag>,
    },
}

impl Emission {
    /// Metric name of this emission.
    pub fn name(&self) -> &str {
        match self {
            Emission::Count { name, .. }
            | Emission::Gauge { name, .. }
            | Emission::Histogram { name, .. }
            | Emission::Timing { name, .. } => name,
        }
    }

    /// Tags of this emission.
    pub fn tags(&self) -> &[Tag] {
        match self {
            Emission::Count { tags, .. }
            | Emission::Gauge { tags, .. }
            | Emission::Histogram { tags, .. }
            | Emission::Timing { tags, .. } => tags,
        }
    }

    /// Tags of this emission rendered as `key:value` strings.
    pub fn rendered_tags(&self) -> Vec<String> {
        self.tags().iter().map(ToString::to_string).collect()
    }
}

/// A sink that records every emission, in call order, for later inspection.
///
/// Clones share the same underlying storage, so a clone can be handed to the code under test while
/// the original is kept for assertions.
#[derive(Clone, Debug, Default)]
pub struct DebuggingSink {
    emissions: Arc<Mutex<Vec<Emission>>>,
}

impl DebuggingSink {
    /// Creates a new, empty `DebuggingSink`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every emission recorded so far.
    pub fn emissions(&self) -> Vec<Emission> {
        self.emissions.lock().clone()
    }

    /// Returns the emissions recorded under the given metric name.
    pub fn emissions_named(&self, name: &str) -> Vec<Emission> {
        self.emissions.lock().iter().filter(|e| e.name() == name).cloned().collect()
    }

    /// Discards every emission recorded so far.
    pub fn clear(&self) {
        self.emissions.lock().clear();
    }

    fn push(&self, emission: Emission) {
        self.emissions.lock().push(emission);
    }
}

impl MetricSink for DebuggingSink {
    fn count(&self, name: &str, value: u64, tags: &[Tag]) {
        self.push(Emission::Count { name: name.to_owned(), value, tags: tags.to_vec() });
    }

    fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        self.push(Emission::Gauge { name: name.to_owned(), value, tags: tags.to_vec() });
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        self.push(Emission::Histogram { name: name.to_owned(), value, tags: tags.to_vec() });
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        self.push(Emission::Timing { name: name.to_owned(), value, tags: tags.to_vec() });
    }
}
