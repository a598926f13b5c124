use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use http::{request::Parts, Method, Request, Response, StatusCode};
use metrics::SharedString;
use metrics_rollup::{MetricSink, Tag};
use pin_project::{pin_project, pinned_drop};
use quanta::{Clock, Instant};
use tower::{BoxError, Layer, Service};
use tracing::{debug, trace};

use crate::{
    body::{ByteCounter, CountingBody},
    cancel::Cancellation,
    config::{dogstatsd_sink, run_taggers, BuildError, CommonConfig, DogStatsDOptions, RequestTagger},
    stats::Stats,
    status::{classify, classify_abandoned, error_to_status_code, Outcome},
    trace::{ClientTraceHandle, PhaseNames, RoundTripTracer},
};

/// Names of the metrics emitted for every round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMetricNames {
    /// Time taken by the inner service to produce a response.
    pub request_time: String,
    /// Request body bytes sent.
    pub bytes_sent: String,
    /// Response body bytes received.
    pub bytes_received: String,
    /// Sum of the request and response body bytes.
    pub bytes_total: String,
    /// Connection lifecycle phases, emitted by transports that fire [`ClientTrace`](crate::ClientTrace)
    /// hooks.
    pub phases: PhaseNames,
}

impl Default for ClientMetricNames {
    fn default() -> Self {
        ClientMetricNames {
            request_time: "client_request_time".to_owned(),
            bytes_sent: "client_request_bytes_sent".to_owned(),
            bytes_received: "client_request_bytes_received".to_owned(),
            bytes_total: "client_request_bytes_total".to_owned(),
            phases: PhaseNames::default(),
        }
    }
}

/// Builder for creating and configuring the client instrumentation layer.
///
/// Metrics are emitted through the [`Stats`] attached to the outbound request when there is one,
/// such as when the request is made while handling a request instrumented by
/// [`ServerMetricsLayer`](crate::ServerMetricsLayer). Otherwise, they go to the sinks configured
/// here.
#[derive(Default)]
pub struct ClientMetricsBuilder {
    names: ClientMetricNames,
    common: CommonConfig,
}

impl ClientMetricsBuilder {
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

    /// Adds a tagger run against every outbound request.
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

    /// Sets the clock used to time round trips and their phases.
    ///
    /// Defaults to the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.common.clock = clock;
        self
    }

    /// Sets the name of the round trip duration timing.
    ///
    /// Defaults to `client_request_time`.
    #[must_use]
    pub fn with_request_time_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.request_time = name.into();
        self
    }

    /// Sets the name of the request body size histogram.
    ///
    /// Defaults to `client_request_bytes_sent`.
    #[must_use]
    pub fn with_bytes_sent_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.bytes_sent = name.into();
        self
    }

    /// Sets the name of the response body size histogram.
    ///
    /// Defaults to `client_request_bytes_received`.
    #[must_use]
    pub fn with_bytes_received_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.bytes_received = name.into();
        self
    }

    /// Sets the name of the combined body size histogram.
    ///
    /// Defaults to `client_request_bytes_total`.
    #[must_use]
    pub fn with_bytes_total_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.bytes_total = name.into();
        self
    }

    /// Sets the name of the connection acquisition timing.
    ///
    /// Defaults to `client_got_connection`.
    #[must_use]
    pub fn with_got_connection_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.got_connection = name.into();
        self
    }

    /// Sets the name of the idle connection timing.
    ///
    /// Defaults to `client_connection_idle`.
    #[must_use]
    pub fn with_connection_idle_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.connection_idle = name.into();
        self
    }

    /// Sets the name of the DNS lookup timing.
    ///
    /// Defaults to `client_dns`.
    #[must_use]
    pub fn with_dns_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.dns = name.into();
        self
    }

    /// Sets the name of the TLS handshake timing.
    ///
    /// Defaults to `client_tls`.
    #[must_use]
    pub fn with_tls_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.tls = name.into();
        self
    }

    /// Sets the name of the header write timing.
    ///
    /// Defaults to `client_wrote_headers`.
    #[must_use]
    pub fn with_wrote_headers_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.wrote_headers = name.into();
        self
    }

    /// Sets the name of the time to first response byte timing.
    ///
    /// Defaults to `client_first_response_byte`.
    #[must_use]
    pub fn with_first_response_byte_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.first_response_byte = name.into();
        self
    }

    /// Sets the name of the idle pool return counter.
    ///
    /// Defaults to `client_put_idle`.
    #[must_use]
    pub fn with_put_idle_name<N: Into<String>>(mut self, name: N) -> Self {
        self.names.phases.put_idle = name.into();
        self
    }

    /// Builds the layer.
    pub fn build(self) -> ClientMetricsLayer {
        let sink = self.common.terminal_sink();
        debug!(
            sinks = self.common.sinks.len(),
            tags = self.common.tags.len(),
            taggers = self.common.taggers.len(),
            "Built client metrics layer."
        );

        let ClientMetricNames { request_time, bytes_sent, bytes_received, bytes_total, phases } =
            self.names;
        ClientMetricsLayer {
            shared: Arc::new(Shared {
                request_time,
                bytes_sent,
                bytes_received,
                bytes_total,
                phases: Arc::new(phases),
                tags: self.common.tags,
                taggers: self.common.taggers,
                sink,
                clock: self.common.clock,
            }),
        }
    }
}

struct Shared {
    request_time: String,
    bytes_sent: String,
    bytes_received: String,
    bytes_total: String,
    phases: Arc<PhaseNames>,
    tags: Vec<Tag>,
    taggers: Vec<RequestTagger>,
    sink: Arc<dyn MetricSink>,
    clock: Clock,
}

/// Layer instrumenting an HTTP client.
///
/// Every round trip through the wrapped service is timed, and a [`RoundTripTracer`] is attached to
/// the request so that transports firing [`ClientTrace`](crate::ClientTrace) hooks produce
/// connection lifecycle metrics. All metrics carry the request tags followed by the static tags.
/// The round trip timing additionally carries:
///
/// - `method`: the request method
/// - `status_code`: the response status code, or for transport errors, `504` if the request timed
///   out or was cancelled and `502` otherwise
/// - `status`: the [`Outcome`](crate::Outcome) of the round trip
///
/// The request body size is emitted when the round trip returns. The response body size, and the
/// combined size, are emitted once the response body is dropped.
///
/// Errors from the wrapped service are boxed into a [`BoxError`], so stacks built from Tower's own
/// middleware (timeouts, buffers) can be wrapped directly. The status code is derived from the
/// boxed error and its source chain.
#[derive(Clone)]
pub struct ClientMetricsLayer {
    shared: Arc<Shared>,
}

impl ClientMetricsLayer {
    /// Creates a builder for configuring the layer.
    pub fn builder() -> ClientMetricsBuilder {
        ClientMetricsBuilder::default()
    }
}

impl<S> Layer<S> for ClientMetricsLayer {
    type Service = ClientMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClientMetricsService { shared: Arc::clone(&self.shared), inner }
    }
}

/// Service produced by [`ClientMetricsLayer`].
#[derive(Clone)]
pub struct ClientMetricsService<S> {
    shared: Arc<Shared>,
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ClientMetricsService<S>
where
    S: Service<Request<CountingBody<ReqBody>>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
{
    type Response = Response<CountingBody<ResBody>>;
    type Error = BoxError;
    type Future = ClientMetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (mut parts, body) = req.into_parts();

        let mut tags = run_taggers(&self.shared.taggers, &parts);
        tags.extend_from_slice(&self.shared.tags);

        let sink: Arc<dyn MetricSink> = match Stats::from_extensions(&parts.extensions) {
            Some(stats) => stats,
            None => Arc::clone(&self.shared.sink),
        };

        let tracer = RoundTripTracer::new(
            Arc::clone(&sink),
            tags.clone(),
            Arc::clone(&self.shared.phases),
            self.shared.clock.clone(),
        );
        ClientTraceHandle::new(tracer).attach(&mut parts.extensions);

        let round_trip = RoundTrip {
            shared: Arc::clone(&self.shared),
            sink,
            tags,
            method: parts.method.clone(),
            cancellation: Cancellation::from_extensions(&parts.extensions),
            sent: ByteCounter::new(),
            start: self.shared.clock.now(),
        };

        let req = Request::from_parts(parts, CountingBody::new(body, round_trip.sent.clone()));
        ClientMetricsFuture { inner: self.inner.call(req), round_trip: Some(round_trip) }
    }
}

struct RoundTrip {
    shared: Arc<Shared>,
    sink: Arc<dyn MetricSink>,
    tags: Vec<Tag>,
    method: Method,
    cancellation: Option<Cancellation>,
    sent: ByteCounter,
    start: Instant,
}

impl RoundTrip {
    /// Emits the round trip timing and the request body size, returning the latter.
    fn record(&self, status: StatusCode, outcome: Outcome) -> u64 {
        let shared = &self.shared;
        let elapsed = shared.clock.now().duration_since(self.start);
        let sent = self.sent.get();

        let mut timing_tags = Vec::with_capacity(self.tags.len() + 3);
        timing_tags.extend_from_slice(&self.tags);
        timing_tags.push(Tag::new("method", self.method.as_str().to_owned()));
        timing_tags.push(Tag::new("status_code", status.as_u16().to_string()));
        timing_tags.push(Tag::from_static_parts("status", outcome.as_str()));
        trace!(tags = ?timing_tags, ?elapsed, sent, "Recording round trip metrics.");

        self.sink.timing(&shared.request_time, elapsed, &timing_tags);
        self.sink.histogram(&shared.bytes_sent, sent as f64, &self.tags);
        sent
    }
}

/// Response future for [`ClientMetricsService`].
///
/// If dropped before the inner future resolves, the round trip is recorded with status `504` and an
/// outcome of `timeout` if its [`Cancellation`] expired, or `cancelled` otherwise.
#[pin_project(PinnedDrop)]
pub struct ClientMetricsFuture<F> {
    #[pin]
    inner: F,
    round_trip: Option<RoundTrip>,
}

impl<F, ResBody, E> Future for ClientMetricsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    E: Into<BoxError>,
{
    type Output = Result<Response<CountingBody<ResBody>>, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result: Result<Response<ResBody>, BoxError> = ready!(this.inner.poll(cx)).map_err(Into::into);
        let Some(round_trip) = this.round_trip.take() else {
            let wrap = |response: Response<ResBody>| response.map(|body| CountingBody::new(body, ByteCounter::new()));
            return Poll::Ready(result.map(wrap));
        };

        let status = match &result {
            Ok(response) => response.status(),
            Err(e) => error_to_status_code(&**e, round_trip.cancellation.as_ref()),
        };
        let sent = round_trip.record(status, classify(round_trip.cancellation.as_ref(), status));

        let response = result?;
        let RoundTrip { shared, sink, tags, .. } = round_trip;
        Poll::Ready(Ok(response.map(|body| {
            CountingBody::new(body, ByteCounter::new()).on_drop(move |received| {
                trace!(received, "Recording response body size.");
                sink.histogram(&shared.bytes_received, received as f64, &tags);
                sink.histogram(&shared.bytes_total, received.saturating_add(sent) as f64, &tags);
            })
        })))
    }
}

#[pinned_drop]
impl<F> PinnedDrop for ClientMetricsFuture<F> {
    fn drop(self: Pin<&mut Self>) {
        if let Some(round_trip) = self.project().round_trip.take() {
            let outcome = classify_abandoned(round_trip.cancellation.as_ref());
            debug!(method = %round_trip.method, %outcome, "Round trip dropped before the transport responded.");
            round_trip.record(StatusCode::GATEWAY_TIMEOUT, outcome);
        }
    }
}
