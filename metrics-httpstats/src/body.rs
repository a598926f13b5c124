use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};

use bytes::Buf as _;
use http_body::{Body, Frame, SizeHint};
use pin_project::{pin_project, pinned_drop};

/// Shared count of body bytes.
///
/// The body and the code emitting metrics about it run independently of each other, so the count
/// is atomic. A read taken before the body has been fully drained under-counts.
#[derive(Clone, Debug, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    /// Creates a new counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` to the count.
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current count.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

type Finalizer = Box<dyn FnOnce(u64) + Send>;

/// A body that counts the data bytes flowing through it.
///
/// An optional finalizer is run exactly once, with the final count, when the body is dropped:
/// whether it was read to completion or abandoned partway.
#[pin_project(PinnedDrop)]
pub struct CountingBody<B> {
    #[pin]
    inner: B,
    counter: ByteCounter,
    on_drop: Option<Finalizer>,
}

impl<B> CountingBody<B> {
    /// Wraps `inner`, adding every data byte read from it to `counter`.
    pub fn new(inner: B, counter: ByteCounter) -> Self {
        CountingBody { inner, counter, on_drop: None }
    }

    pub(crate) fn on_drop<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.on_drop = Some(Box::new(finalizer));
        self
    }

    /// The counter this body adds to.
    pub fn counter(&self) -> &ByteCounter {
        &self.counter
    }
}

impl<B: fmt::Debug> fmt::Debug for CountingBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingBody")
            .field("inner", &self.inner)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl<B: Body> Body for CountingBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if let Some(data) = frame.as_ref().and_then(|f| f.as_ref().ok()).and_then(Frame::data_ref) {
            this.counter.add(data.remaining() as u64);
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<B> PinnedDrop for CountingBody<B> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(finalizer) = this.on_drop.take() {
            finalizer(this.counter.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};

    use super::{ByteCounter, CountingBody};

    #[tokio::test]
    async fn test_counts_data_frames() {
        let counter = ByteCounter::new();
        let mut body = CountingBody::new(Full::new(Bytes::from_static(b"hello world")), counter.clone());
        assert_eq!(body.counter().get(), 0);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.data_ref().map(|data| data.len()), Some(11));
        assert_eq!(body.counter().get(), 11);
        assert_eq!(counter.get(), 11);
    }

    #[tokio::test]
    async fn test_finalizer_runs_once_on_drop() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let calls = Arc::new(AtomicU64::new(0));

        let body = {
            let seen = seen.clone();
            let calls = calls.clone();
            CountingBody::new(Full::new(Bytes::from_static(b"abc")), ByteCounter::new()).on_drop(
                move |bytes| {
                    seen.store(bytes, Ordering::SeqCst);
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            )
        };

        let _ = body.collect().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_runs_for_unread_body() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let body = {
            let seen = seen.clone();
            CountingBody::new(Full::new(Bytes::from_static(b"abc")), ByteCounter::new())
                .on_drop(move |bytes| seen.store(bytes, Ordering::SeqCst))
        };

        drop(body);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
