//! Tagged metric sinks with global tag rollup.
//!
//! Metrics annotated with high-cardinality dimensions, such as a per-host identifier, cannot have
//! their percentiles re-aggregated by the backend. This crate solves that on the emitting side: a
//! [`Rollup`](layers::Rollup) sink re-emits every distribution once per granularity, from fully
//! global down to the most specific dimension, so each level can be queried directly.
//!
//! The building blocks are:
//! - [`Tag`], a `key:value` annotation;
//! - [`compute_variants`], the pure rollup algorithm;
//! - [`MetricSink`], the capability every sink implements;
//! - [`layers`], decorators for rolling up, adding static tags, and fanning out;
//! - [`RecorderSink`], which forwards into any [`metrics`] recorder/exporter;
//! - [`DebuggingSink`], for asserting on emissions in tests.
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod debugging;
pub use self::debugging::{DebuggingSink, Emission};

pub mod layers;

mod recorder;
pub use self::recorder::{GlobalRecorder, RecorderSink};

mod rollup;
pub use self::rollup::compute_variants;

mod sink;
pub use self::sink::{MetricSink, NoopSink};

mod tag;
pub use self::tag::{ParseTagError, Tag, GLOBAL_TOKEN};
