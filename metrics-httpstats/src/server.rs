use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use http::{request::Parts, Method, Request, Response, StatusCode};
use metrics::SharedString;
use metrics_rollup::{MetricSink, Tag};
use pin_project::{pin_project, pinned_drop};
use quanta::{Clock, Instant};
use tower::{Layer, Service};
use tracing::{debug, trace};

use crate::{
    body::{ByteCounter, CountingBody},
    cancel::Cancellation,
    config::{dogstatsd_sink, run_taggers, BuildError, CommonConfig, DogStatsDOptions, RequestTagger},
    stats::Stats,
    status::{classify, classify_abandoned, Outcome},
};

/// Names of the metrics emitted for every handled request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerMetricNames {
    /// Time taken by the inner service to produce a response.
    pub request_time: String,
    /// Request body bytes read.
    pub bytes_received: String,
    /// Response body bytes written.
    pub bytes_returned: String,
    /// Sum of the request and response body bytes.
    pub bytes_total: String,
}

impl Default for ServerMetricNames {
    fn default() -> Self {
        ServerMetricNames {
            request_time: "service_time".to_owned(),
            bytes_received: "service_bytes_received".to_owned(),
            bytes_returned: "service_bytes_returned".to_owned(),
            bytes_total: "service_bytes_total".to_owned(),
        }
    }
}

/// Builder for creating and configuring the server instrumentation layer.
///
/// With no sinks configured, the layer still tracks requests and attaches [`Stats`] to them, but
/// every emission is discarded.
#[derive(Default)]
pub struct ServerMetricsBuilder {
    names: ServerMetricNames,
    common: CommonConfig,
}

impl ServerMetricsBuilder {
    /// Adds a static tag to every emitted metric.
    #[must_use]
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        self.common.add_tag(key, value);
        self
    }

    /// Adds a tagger run against every incoming request.
    ///
    /// The resulting tag is attached to the request's [`Stats`], and so to every metric emitted
    /// while handling it.
    #[must_use]
    pub fn with_request_tagger<F, K, V>(mut self, tagger: F) -> Self
    where
        F: Fn(&Parts) -> (K, V) + Send + Sync + 'static,
        K: Into<SharedString>,
        V: Into<SharedString>,
    {
        self.common.add_tagger(tagger);
        self
    }

    /// Adds a sink to emit metrics to.
    #[must_use]
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: MetricSink + 'static,
    {
        self.common.sinks.push(Arc::new(sink));
        self
    }

    /// Adds a sink that receives every distribution once per level of the given global keys.
    ///
    /// An empty key list disables the rollup for this sink.
    #[must_use]
    pub fn with_rollup_sink<S, I, K>(mut self, sink: S, keys: I) -> Self
    where
        S: MetricSink + 'static,
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.common.add_rollup_sink(Arc::new(sink), keys);
        self
    }

    /// Adds a DogStatsD sink configured by `options`.
    ///
    /// # Errors
    ///
    /// If the address is invalid or the exporter cannot be built, an error is returned.
    pub fn with_dogstatsd(mut self, options: DogStatsDOptions) -> Result<Self, BuildError> {
        self.common.sinks.push(dogstatsd_sink(&options)?);
        Ok(self)
    }

    /// Adds a DogStatsD sink configured by `options`, with a rollup over the given global keys.
    ///
    /// # Errors
    ///
    /// If the address is invalid or the exporter cannot be built, an error is returned.
    pub fn with_dogstatsd_rollup<I, K>(mut self, options: DogStatsDOptions, keys: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let sink = dogstatsd_sink(&options)?;
        self.common.add_rollup_sink(sink, keys);
        Ok(self)
    }

    /// Sets the clock used to time requests.
    ///
    /// Defaults to the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.common.clock = clock;
        self
    }

    /// Sets the name of the request duration timing.
    ///
    /// Defaults to `service_time`.
    #[must_use]
    pub fn with_request_time_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.request_time = name.into();
        self
    }

    /// Sets the name of the request body size histogram.
    ///
    /// Defaults to `service_bytes_received`.
    #[must_use]
    pub fn with_bytes_received_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.bytes_received = name.into();
        self
    }

    /// Sets the name of the response body size histogram.
    ///
    /// Defaults to `service_bytes_returned`.
    #[must_use]
    pub fn with_bytes_returned_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.bytes_returned = name.into();
        self
    }

    /// Sets the name of the combined body size histogram.
    ///
    /// Defaults to `service_bytes_total`.
    #[must_use]
    pub fn with_bytes_total_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.bytes_total = name.into();
        self
    }

    /// Builds the layer.
    pub fn build(self) -> ServerMetricsLayer {
        let sink = self.common.tagged_sink();
        debug!(
            sinks = self.common.sinks.len(),
            tags = self.common.tags.len(),
            taggers = self.common.taggers.len(),
            "Built server metrics layer."
        );

        ServerMetricsLayer {
            shared: Arc::new(Shared {
                names: self.names,
                taggers: self.common.taggers,
                sink,
                clock: self.common.clock,
            }),
        }
    }
}

struct Shared {
    names: ServerMetricNames,
    taggers: Vec<RequestTagger>,
    sink: Arc<dyn MetricSink>,
    clock: Clock,
}

/// Layer instrumenting an HTTP service.
///
/// Every request handled by the wrapped service is timed, and the bytes flowing through its
/// request and response bodies are counted. Once the response body has been dropped, a timing and
/// three size histograms are emitted, tagged with:
///
/// - `server_method`: the request method
/// - `server_status_code`: the response status code
/// - `server_status`: the [`Outcome`](crate::Outcome) of the request
///
/// followed by the request tags and the static tags.
#[derive(Clone)]
pub struct ServerMetricsLayer {
    shared: Arc<Shared>,
}

impl ServerMetricsLayer {
    /// Creates a builder for configuring the layer.
    pub fn builder() -> ServerMetricsBuilder {
        ServerMetricsBuilder::default()
    }

    /// The configured sinks, with the static tags applied.
    ///
    /// Useful for emitting metrics outside of any request.
    pub fn sink(&self) -> Arc<dyn MetricSink> {
        Arc::clone(&self.shared.sink)
    }
}

impl<S> Layer<S> for ServerMetricsLayer {
    type Service = ServerMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServerMetricsService { shared: Arc::clone(&self.shared), inner }
    }
}

/// Service produced by [`ServerMetricsLayer`].
#[derive(Clone)]
pub struct ServerMetricsService<S> {
    shared: Arc<Shared>,
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ServerMetricsService<S>
where
    S: Service<Request<CountingBody<ReqBody>>, Response = Response<ResBody>>,
{
    type Response = Response<CountingBody<ResBody>>;
    type Error = S::Error;
    type Future = ServerMetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (mut parts, body) = req.into_parts();

        let tags = run_taggers(&self.shared.taggers, &parts);
        let stats = Arc::new(Stats::with_tags(Arc::clone(&self.shared.sink), tags));
        parts.extensions.insert(Arc::clone(&stats));

        let request = InFlightRequest {
            shared: Arc::clone(&self.shared),
            stats,
            method: parts.method.clone(),
            cancellation: Cancellation::from_extensions(&parts.extensions),
            received: ByteCounter::new(),
            start: self.shared.clock.now(),
        };

        let req = Request::from_parts(parts, CountingBody::new(body, request.received.clone()));
        ServerMetricsFuture { inner: self.inner.call(req), request: Some(request) }
    }
}

struct InFlightRequest {
    shared: Arc<Shared>,
    stats: Arc<Stats>,
    method: Method,
    cancellation: Option<Cancellation>,
    received: ByteCounter,
    start: Instant,
}

impl InFlightRequest {
    /// Captures everything known once the request has ended.
    fn complete(self, status: StatusCode, outcome: Outcome) -> CompletedRequest {
        CompletedRequest {
            tags: [
                Tag::new("server_method", self.method.as_str().to_owned()),
                Tag::new("server_status_code", status.as_u16().to_string()),
                Tag::from_static_parts("server_status", outcome.as_str()),
            ],
            elapsed: self.shared.clock.now().duration_since(self.start),
            shared: self.shared,
            stats: self.stats,
            received: self.received,
        }
    }
}

struct CompletedRequest {
    shared: Arc<Shared>,
    stats: Arc<Stats>,
    tags: [Tag; 3],
    elapsed: Duration,
    received: ByteCounter,
}

impl CompletedRequest {
    fn emit(self, returned: u64) {
        let names = &self.shared.names;
        let received = self.received.get();
        trace!(tags = ?self.tags, elapsed = ?self.elapsed, received, returned, "Recording request metrics.");

        self.stats.timing(&names.request_time, self.elapsed, &self.tags);
        self.stats.histogram(&names.bytes_received, received as f64, &self.tags);
        self.stats.histogram(&names.bytes_returned, returned as f64, &self.tags);
        self.stats.histogram(&names.bytes_total, received.saturating_add(returned) as f64, &self.tags);
    }
}

/// Response future for [`ServerMetricsService`].
///
/// If dropped before the inner future resolves, the request is recorded with status `504` and an
/// outcome of `timeout` if its [`Cancellation`] expired, or `cancelled` otherwise.
#[pin_project(PinnedDrop)]
pub struct ServerMetricsFuture<F> {
    #[pin]
    inner: F,
    request: Option<InFlightRequest>,
}

impl<F, ResBody, E> Future for ServerMetricsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<CountingBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let Some(request) = this.request.take() else {
            let wrap = |response: Response<ResBody>| response.map(|body| CountingBody::new(body, ByteCounter::new()));
            return Poll::Ready(result.map(wrap));
        };

        match result {
            Ok(response) => {
                let status = response.status();
                let outcome = classify(request.cancellation.as_ref(), status);
                let completed = request.complete(status, outcome);
                Poll::Ready(Ok(response.map(|body| {
                    CountingBody::new(body, ByteCounter::new()).on_drop(move |returned| completed.emit(returned))
                })))
            }
            Err(e) => {
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let outcome = classify(request.cancellation.as_ref(), status);
                request.complete(status, outcome).emit(0);
                Poll::Ready(Err(e))
            }
        }
    }
}

#[pinned_drop]
impl<F> PinnedDrop for ServerMetricsFuture<F> {
    fn drop(self: Pin<&mut Self>) {
        if let Some(request) = self.project().request.take() {
            let outcome = classify_abandoned(request.cancellation.as_ref());
            debug!(method = %request.method, %outcome, "Request dropped before the service responded.");
            request.complete(StatusCode::GATEWAY_TIMEOUT, outcome).emit(0);
        }
    }
}
