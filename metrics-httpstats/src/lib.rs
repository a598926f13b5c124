//! HTTP server and client instrumentation.
//!
//! This crate provides two [`tower`] layers:
//!
//! - [`ServerMetricsLayer`], which times every request handled by the wrapped service and measures
//!   the size of the request and response bodies;
//! - [`ClientMetricsLayer`], which does the same for outbound round trips, and additionally turns
//!   connection lifecycle events fired by the transport (see [`ClientTrace`]) into phase timings.
//!
//! Both layers emit to one or more [`MetricSink`](metrics_rollup::MetricSink)s, optionally wrapped
//! in a [rollup](metrics_rollup::layers::Rollup) so that distributions stay aggregatable across
//! high-cardinality dimensions such as hosts:
//!
//! ```no_run
//! # use std::convert::Infallible;
//! # use http::{Request, Response};
//! # use metrics_httpstats::{CountingBody, DogStatsDOptions, ServerMetricsBuilder};
//! # use tower::{service_fn, Layer};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let layer = ServerMetricsBuilder::default()
//!     .with_tag("service", "search")
//!     .with_request_tagger(|parts| ("route", parts.uri.path().to_owned()))
//!     .with_dogstatsd_rollup(DogStatsDOptions::new("127.0.0.1:8125").with_prefix("myapp"), ["region", "az", "host"])?
//!     .build();
//!
//! let service = layer.layer(service_fn(|_req: Request<CountingBody<String>>| async {
//!     Ok::<_, Infallible>(Response::new(String::from("hello")))
//! }));
//! # drop(service);
//! # Ok(())
//! # }
//! ```
//!
//! Handlers behind the server layer can emit their own metrics, carrying the same request tags,
//! through the [`Stats`] attached to each request. The client layer emits through that same
//! [`Stats`] when it finds one on the outbound request.
//!
//! Cancellations and timeouts are only visible to the layers if the application attaches a
//! [`Cancellation`] to the request and fires it.
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod body;
pub use self::body::{ByteCounter, CountingBody};

mod cancel;
pub use self::cancel::{CancelReason, Cancellation};

mod client;
pub use self::client::{
    ClientMetricNames, ClientMetricsBuilder, ClientMetricsFuture, ClientMetricsLayer, ClientMetricsService,
};

mod config;
pub use self::config::{BuildError, DogStatsDOptions};

mod server;
pub use self::server::{
    ServerMetricNames, ServerMetricsBuilder, ServerMetricsFuture, ServerMetricsLayer, ServerMetricsService,
};

mod stats;
pub use self::stats::Stats;

mod status;
pub use self::status::{classify, error_to_status_code, Outcome};

mod trace;
pub use self::trace::{ClientTrace, ClientTraceHandle, DnsDoneInfo, GotConnInfo, PhaseNames, RoundTripTracer};
