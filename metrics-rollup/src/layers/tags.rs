use std::time::Duration;

use metrics_util::layers::Layer;

use crate::{sink::MetricSink, tag::Tag};

/// Appends a fixed set of tags to every emission.
///
/// Static tags are added after the tags given at the call site.
pub struct Tagged<S> {
    tags: Vec<Tag>,
    inner: S,
}

impl<S> Tagged<S> {
    fn with_tags<F>(&self, tags: &[Tag], emit: F)
    where
        F: FnOnce(&[Tag]),
    {
        if self.tags.is_empty() {
            return emit(tags);
        }

        let mut combined = Vec::with_capacity(tags.len() + self.tags.len());
        combined.extend_from_slice(tags);
        combined.extend_from_slice(&self.tags);
        emit(&combined);
    }
}

impl<S: MetricSink> MetricSink for Tagged<S> {
    fn count(&self, name: &str, value: u64, tags: &[Tag]) {
        self.with_tags(tags, |tags| self.inner.count(name, value, tags));
    }

    fn gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        self.with_tags(tags, |tags| self.inner.gauge(name, value, tags));
    }

    fn histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        self.with_tags(tags, |tags| self.inner.histogram(name, value, tags));
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        self.with_tags(tags, |tags| self.inner.timing(name, value, tags));
    }
}

/// A layer for applying static tags to every emission.
///
/// More information on the behavior of the layer can be found in [`Tagged`].
#[derive(Clone, Debug, Default)]
pub struct TagsLayer(Vec<Tag>);

impl TagsLayer {
    /// Creates a new `TagsLayer` from the given tags.
    pub fn new<I>(tags: I) -> Self
    where
        I: IntoIterator<Item = Tag>,
    {
        TagsLayer(tags.into_iter().collect())
    }
}

impl<S> Layer<S> for TagsLayer {
    type Output = Tagged<S>;

    fn layer(&self, inner: S) -> Self::Output {
        Tagged { tags: self.0.clone(), inner }
    }
}
