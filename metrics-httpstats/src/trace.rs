//! Connection lifecycle tracing for outbound requests.
//!
//! The client layer attaches a [`ClientTraceHandle`] to every request it forwards. Transports that
//! support tracing look the handle up and fire the [`ClientTrace`] hooks as the round trip
//! progresses:
//!
//! ```text
//! get_conn -> got_conn -> [tls_handshake_start -> tls_handshake_done] -> wrote_headers
//!          -> got_first_response_byte -> (body read) -> put_idle_conn
//! ```
//!
//! `dns_start`/`dns_done` are independent of that chain and may fire at any point before
//! `got_conn`. Hooks may be called from any thread, and `put_idle_conn` typically fires only after
//! the response body has been read, long after the round trip itself returned.
use std::{error::Error, fmt, ops::Deref, sync::Arc, time::Duration};

use http::{Extensions, Request};
use metrics_rollup::{MetricSink, Tag};
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use tracing::{debug, trace};

/// Details about the connection obtained for a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GotConnInfo {
    /// The connection was used for a previous request.
    pub reused: bool,

    /// The connection was taken from the idle pool.
    pub was_idle: bool,

    /// How long the connection sat in the idle pool, if `was_idle` is set.
    pub idle_time: Duration,
}

/// Result of a DNS lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsDoneInfo<'a> {
    /// The lookup was shared with another concurrent lookup for the same host.
    pub coalesced: bool,

    /// The lookup failed.
    pub error: Option<&'a (dyn Error + 'static)>,
}

/// Hooks fired over the lifecycle of a single outbound request.
///
/// All hooks default to doing nothing.
pub trait ClientTrace: Send + Sync {
    /// A connection is about to be obtained, either from the pool or by dialing.
    fn get_conn(&self, _host_port: &str) {}

    /// A connection was obtained.
    fn got_conn(&self, _info: GotConnInfo) {}

    /// A DNS lookup started.
    fn dns_start(&self, _host: &str) {}

    /// A DNS lookup finished.
    fn dns_done(&self, _info: DnsDoneInfo<'_>) {}

    /// A TLS handshake started.
    fn tls_handshake_start(&self) {}

    /// A TLS handshake finished.
    fn tls_handshake_done(&self, _error: Option<&(dyn Error + 'static)>) {}

    /// The request headers were written.
    fn wrote_headers(&self) {}

    /// The first byte of the response headers was read.
    fn got_first_response_byte(&self) {}

    /// The connection was returned to the idle pool, or failed to be.
    fn put_idle_conn(&self, _error: Option<&(dyn Error + 'static)>) {}
}

/// Shared handle to a [`ClientTrace`], carried in request extensions.
#[derive(Clone)]
pub struct ClientTraceHandle(Arc<dyn ClientTrace>);

impl ClientTraceHandle {
    /// Creates a new handle around the given trace.
    pub fn new<T>(trace: T) -> Self
    where
        T: ClientTrace + 'static,
    {
        ClientTraceHandle(Arc::new(trace))
    }

    /// Gets the trace attached to the given extensions, if any.
    pub fn from_extensions(extensions: &Extensions) -> Option<ClientTraceHandle> {
        extensions.get::<ClientTraceHandle>().cloned()
    }

    /// Gets the trace attached to the given request, if any.
    pub fn from_request<B>(req: &Request<B>) -> Option<ClientTraceHandle> {
        Self::from_extensions(req.extensions())
    }

    /// Attaches this trace to the given extensions.
    ///
    /// If a trace is already attached, the two are composed: this trace's hooks fire first,
    /// followed by the existing trace's.
    pub fn attach(self, extensions: &mut Extensions) {
        let handle = match extensions.remove::<ClientTraceHandle>() {
            Some(existing) => ClientTraceHandle::new(Composite { first: self, second: existing }),
            None => self,
        };
        extensions.insert(handle);
    }
}

impl Deref for ClientTraceHandle {
    type Target = dyn ClientTrace;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for ClientTraceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTraceHandle").finish_non_exhaustive()
    }
}

struct Composite {
    first: ClientTraceHandle,
    second: ClientTraceHandle,
}

impl ClientTrace for Composite {
    fn get_conn(&self, host_port: &str) {
        self.first.get_conn(host_port);
        self.second.get_conn(host_port);
    }

    fn got_conn(&self, info: GotConnInfo) {
        self.first.got_conn(info);
        self.second.got_conn(info);
    }

    fn dns_start(&self, host: &str) {
        self.first.dns_start(host);
        self.second.dns_start(host);
    }

    fn dns_done(&self, info: DnsDoneInfo<'_>) {
        self.first.dns_done(info);
        self.second.dns_done(info);
    }

    fn tls_handshake_start(&self) {
        self.first.tls_handshake_start();
        self.second.tls_handshake_start();
    }

    fn tls_handshake_done(&self, error: Option<&(dyn Error + 'static)>) {
        self.first.tls_handshake_done(error);
        self.second.tls_handshake_done(error);
    }

    fn wrote_headers(&self) {
        self.first.wrote_headers();
        self.second.wrote_headers();
    }

    fn got_first_response_byte(&self) {
        self.first.got_first_response_byte();
        self.second.got_first_response_byte();
    }

    fn put_idle_conn(&self, error: Option<&(dyn Error + 'static)>) {
        self.first.put_idle_conn(error);
        self.second.put_idle_conn(error);
    }
}

/// Metric names for each connection lifecycle phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseNames {
    /// Time from requesting a connection to obtaining one.
    pub got_connection: String,
    /// Time a reused connection spent in the idle pool.
    pub connection_idle: String,
    /// DNS lookup time.
    pub dns: String,
    /// TLS handshake time.
    pub tls: String,
    /// Time from obtaining a connection to writing the request headers.
    pub wrote_headers: String,
    /// Time from writing the request headers to reading the first response byte.
    pub first_response_byte: String,
    /// Connections returned to the idle pool.
    pub put_idle: String,
}

impl Default for PhaseNames {
    fn default() -> Self {
        PhaseNames {
            got_connection: "client_got_connection".to_owned(),
            connection_idle: "client_connection_idle".to_owned(),
            dns: "client_dns".to_owned(),
            tls: "client_tls".to_owned(),
            wrote_headers: "client_wrote_headers".to_owned(),
            first_response_byte: "client_first_response_byte".to_owned(),
            put_idle: "client_put_idle".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
struct PhaseStarts {
    get_conn: Option<Instant>,
    got_conn: Option<Instant>,
    dns_start: Option<Instant>,
    tls_start: Option<Instant>,
    wrote_headers: Option<Instant>,
}

fn flag(key: &'static str, value: bool) -> Tag {
    Tag::from_static_parts(key, if value { "true" } else { "false" })
}

/// Turns lifecycle hooks into phase timing metrics for a single round trip.
///
/// Each `done`-style hook emits a timing measured from its matching `start`-style hook:
///
/// | hook | metric | measured from | extra tags |
/// |---|---|---|---|
/// | `got_conn` | `got_connection` | `get_conn` | `reused`, `idle` |
/// | `got_conn` (idle only) | `connection_idle` | reported idle time | |
/// | `dns_done` | `dns` | `dns_start` | `coalesced`, `error` |
/// | `tls_handshake_done` | `tls` | `tls_handshake_start` | `error` |
/// | `wrote_headers` | `wrote_headers` | `got_conn` | |
/// | `got_first_response_byte` | `first_response_byte` | `wrote_headers` | |
///
/// `put_idle_conn` increments the `put_idle` counter, tagged with `error`. Each start is consumed
/// by its done hook; a done hook without a pending start emits nothing.
///
/// Hooks can fire concurrently from different tasks, so the phase timestamps are kept behind a
/// lock. Emission happens after the lock is released.
pub struct RoundTripTracer {
    sink: Arc<dyn MetricSink>,
    tags: Vec<Tag>,
    names: Arc<PhaseNames>,
    clock: Clock,
    starts: Mutex<PhaseStarts>,
}

impl RoundTripTracer {
    /// Creates a new `RoundTripTracer`.
    ///
    /// `tags` are attached to every emission, ahead of any phase-specific tags.
    pub fn new(sink: Arc<dyn MetricSink>, tags: Vec<Tag>, names: Arc<PhaseNames>, clock: Clock) -> Self {
        RoundTripTracer { sink, tags, names, clock, starts: Mutex::new(PhaseStarts::default()) }
    }

    fn tags_with(&self, extra: &[Tag]) -> Vec<Tag> {
        let mut tags = Vec::with_capacity(self.tags.len() + extra.len());
        tags.extend_from_slice(&self.tags);
        tags.extend_from_slice(extra);
        tags
    }

    /// Records `now` as the start of a phase.
    fn start<F>(&self, slot: F)
    where
        F: FnOnce(&mut PhaseStarts) -> &mut Option<Instant>,
    {
        let now = self.clock.now();
        *slot(&mut *self.starts.lock()) = Some(now);
    }

    /// Consumes the start of a phase, returning the elapsed time since it.
    ///
    /// `then` may record the end of this phase as the start of another under the same lock.
    fn finish<F, G>(&self, phase: &'static str, slot: F, then: G) -> Option<Duration>
    where
        F: FnOnce(&mut PhaseStarts) -> &mut Option<Instant>,
        G: FnOnce(&mut PhaseStarts, Instant),
    {
        let now = self.clock.now();
        let mut starts = self.starts.lock();
        let started = slot(&mut *starts).take();
        then(&mut *starts, now);
        drop(starts);

        match started {
            Some(started) => Some(now.duration_since(started)),
            None => {
                debug!(phase, "Lifecycle event without a matching start; not recording.");
                None
            }
        }
    }

    fn timing(&self, name: &str, value: Duration, tags: &[Tag]) {
        trace!(name, ?value, "Recording round trip phase.");
        self.sink.timing(name, value, tags);
    }
}

impl ClientTrace for RoundTripTracer {
    fn get_conn(&self, _host_port: &str) {
        self.start(|s| &mut s.get_conn);
    }

    fn got_conn(&self, info: GotConnInfo) {
        let elapsed = self.finish("got_conn", |s| &mut s.get_conn, |s, now| s.got_conn = Some(now));
        if let Some(elapsed) = elapsed {
            let tags = self.tags_with(&[flag("reused", info.reused), flag("idle", info.was_idle)]);
            self.timing(&self.names.got_connection, elapsed, &tags);
        }
        if info.was_idle {
            self.timing(&self.names.connection_idle, info.idle_time, &self.tags);
        }
    }

    fn dns_start(&self, _host: &str) {
        self.start(|s| &mut s.dns_start);
    }

    fn dns_done(&self, info: DnsDoneInfo<'_>) {
        if let Some(elapsed) = self.finish("dns_done", |s| &mut s.dns_start, |_, _| {}) {
            let tags = self
                .tags_with(&[flag("coalesced", info.coalesced), flag("error", info.error.is_some())]);
            self.timing(&self.names.dns, elapsed, &tags);
        }
    }

    fn tls_handshake_start(&self) {
        self.start(|s| &mut s.tls_start);
    }

    fn tls_handshake_done(&self, error: Option<&(dyn Error + 'static)>) {
        if let Some(elapsed) = self.finish("tls_handshake_done", |s| &mut s.tls_start, |_, _| {}) {
            let tags = self.tags_with(&[flag("error", error.is_some())]);
            self.timing(&self.names.tls, elapsed, &tags);
        }
    }

    fn wrote_headers(&self) {
        let elapsed =
            self.finish("wrote_headers", |s| &mut s.got_conn, |s, now| s.wrote_headers = Some(now));
        if let Some(elapsed) = elapsed {
            self.timing(&self.names.wrote_headers, elapsed, &self.tags);
        }
    }

    fn got_first_response_byte(&self) {
        if let Some(elapsed) = self.finish("got_first_response_byte", |s| &mut s.wrote_headers, |_, _| {}) {
            self.timing(&self.names.first_response_byte, elapsed, &self.tags);
        }
    }

    fn put_idle_conn(&self, error: Option<&(dyn Error + 'static)>) {
        let tags = self.tags_with(&[flag("error", error.is_some())]);
        self.sink.count(&self.names.put_idle, 1, &tags);
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc, time::Duration};

    use http::Extensions;
    use metrics_rollup::{DebuggingSink, Emission, Tag};
    use parking_lot::Mutex;
    use quanta::Clock;

    use super::{ClientTrace, ClientTraceHandle, DnsDoneInfo, GotConnInfo, PhaseNames, RoundTripTracer};

    fn tracer() -> (RoundTripTracer, DebuggingSink, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let sink = DebuggingSink::new();
        let names = PhaseNames {
            got_connection: "gotconn".to_owned(),
            connection_idle: "connectionidle".to_owned(),
            dns: "dns".to_owned(),
            tls: "tls".to_owned(),
            wrote_headers: "wroteheader".to_owned(),
            first_response_byte: "firstbyte".to_owned(),
            put_idle: "putidle".to_owned(),
        };
        let tracer = RoundTripTracer::new(
            Arc::new(sink.clone()),
            vec![Tag::new("test", "test")],
            Arc::new(names),
            clock,
        );
        (tracer, sink, mock)
    }

    fn timing(name: &str, millis: u64, tags: &[&str]) -> Emission {
        Emission::Timing {
            name: name.to_owned(),
            value: Duration::from_millis(millis),
            tags: tags.iter().map(|t| t.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn test_connection_phases() {
        let (tracer, sink, mock) = tracer();

        tracer.get_conn("localhost:443");
        mock.increment(Duration::from_millis(3));
        tracer.got_conn(GotConnInfo::default());

        tracer.get_conn("localhost:443");
        mock.increment(Duration::from_millis(1));
        tracer.got_conn(GotConnInfo {
            reused: true,
            was_idle: true,
            idle_time: Duration::from_millis(250),
        });

        assert_eq!(
            sink.emissions(),
            vec![
                timing("gotconn", 3, &["test:test", "reused:false", "idle:false"]),
                timing("gotconn", 1, &["test:test", "reused:true", "idle:true"]),
                timing("connectionidle", 250, &["test:test"]),
            ]
        );
    }

    #[test]
    fn test_dns_and_tls_phases() {
        let (tracer, sink, mock) = tracer();
        let failure = io::Error::new(io::ErrorKind::Other, "boom");

        tracer.dns_start("localhost");
        mock.increment(Duration::from_millis(2));
        tracer.dns_done(DnsDoneInfo::default());

        tracer.dns_start("localhost");
        mock.increment(Duration::from_millis(4));
        tracer.dns_done(DnsDoneInfo { coalesced: true, error: Some(&failure) });

        tracer.tls_handshake_start();
        mock.increment(Duration::from_millis(5));
        tracer.tls_handshake_done(None);

        tracer.tls_handshake_start();
        mock.increment(Duration::from_millis(6));
        tracer.tls_handshake_done(Some(&failure));

        assert_eq!(
            sink.emissions(),
            vec![
                timing("dns", 2, &["test:test", "coalesced:false", "error:false"]),
                timing("dns", 4, &["test:test", "coalesced:true", "error:true"]),
                timing("tls", 5, &["test:test", "error:false"]),
                timing("tls", 6, &["test:test", "error:true"]),
            ]
        );
    }

    #[test]
    fn test_request_phases_and_idle_pool() {
        let (tracer, sink, mock) = tracer();
        let failure = io::Error::new(io::ErrorKind::BrokenPipe, "closed");

        tracer.get_conn("localhost:80");
        tracer.got_conn(GotConnInfo::default());
        sink.clear();

        mock.increment(Duration::from_millis(7));
        tracer.wrote_headers();
        mock.increment(Duration::from_millis(20));
        tracer.got_first_response_byte();
        tracer.put_idle_conn(None);
        tracer.put_idle_conn(Some(&failure));

        let count = |error: &str| Emission::Count {
            name: "putidle".to_owned(),
            value: 1,
            tags: vec![Tag::new("test", "test"), Tag::new("error", error.to_owned())],
        };
        assert_eq!(
            sink.emissions(),
            vec![
                timing("wroteheader", 7, &["test:test"]),
                timing("firstbyte", 20, &["test:test"]),
                count("false"),
                count("true"),
            ]
        );
    }

    #[test]
    fn test_unmatched_events_emit_nothing() {
        let (tracer, sink, _mock) = tracer();

        tracer.dns_done(DnsDoneInfo::default());
        tracer.tls_handshake_done(None);
        tracer.wrote_headers();
        tracer.got_first_response_byte();

        assert!(sink.emissions().is_empty());
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<&'static str>>);

    impl ClientTrace for Arc<Recording> {
        fn wrote_headers(&self) {
            self.0.lock().push("wrote_headers");
        }
    }

    #[test]
    fn test_attach_composes_existing_trace() {
        let first = Arc::new(Recording::default());
        let second = Arc::new(Recording::default());
        let mut extensions = Extensions::new();

        ClientTraceHandle::new(second.clone()).attach(&mut extensions);
        ClientTraceHandle::new(first.clone()).attach(&mut extensions);

        let handle = ClientTraceHandle::from_extensions(&extensions).expect("trace attached");
        handle.wrote_headers();
        handle.get_conn("ignored:80");

        assert_eq!(*first.0.lock(), vec!["wrote_headers"]);
        assert_eq!(*second.0.lock(), vec!["wrote_headers"]);
    }
}
