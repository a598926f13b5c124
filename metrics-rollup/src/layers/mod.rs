//! Layers are composable helpers that wrap an existing [`MetricSink`](crate::MetricSink) to alter
//! what reaches it, without changing the sink itself.
//!
//! They implement [`metrics_util::layers::Layer`], so a chain of sinks reads the same way a chain
//! of recorders does:
//!
//! ```
//! # use metrics_rollup::{layers::{FanoutBuilder, RollupLayer, TagsLayer}, DebuggingSink, Tag};
//! use metrics_util::layers::Layer;
//!
//! let per_host = DebuggingSink::new();
//! let rolled_up = DebuggingSink::new();
//!
//! let sink = FanoutBuilder::default()
//!     .add_sink(per_host.clone())
//!     .add_sink(RollupLayer::new(["region", "host"]).layer(rolled_up.clone()))
//!     .build();
//! let sink = TagsLayer::new([Tag::new("service", "search")]).layer(sink);
//! # let _ = sink;
//! ```
mod fanout;
pub use fanout::{Fanout, FanoutBuilder};

mod rollup;
pub use rollup::{Rollup, RollupLayer};

mod tags;
pub use tags::{Tagged, TagsLayer};
