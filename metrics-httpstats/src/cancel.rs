use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use http::{Extensions, Request};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a request was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled explicitly, such as by the client going away.
    Cancelled,

    /// The request's deadline passed.
    DeadlineExceeded,
}

/// Cancellation signal for a single request.
///
/// Attach a `Cancellation` to a request's extensions to let the instrumentation layers tell timed
/// out and cancelled requests apart from successful or failed ones. The layers only ever read the
/// signal; firing it is up to the application.
///
/// The first reason recorded wins. If the underlying token is cancelled directly, or through a
/// parent token, the reason is [`CancelReason::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl Cancellation {
    /// Creates a new, unfired `Cancellation`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `Cancellation` driven by an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Cancellation { token, reason: Arc::default() }
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels the request.
    pub fn cancel(&self) {
        self.fire(CancelReason::Cancelled);
    }

    /// Marks the request's deadline as exceeded.
    pub fn expire(&self) {
        self.fire(CancelReason::DeadlineExceeded);
    }

    /// Spawns a timer that expires the request after `timeout`, unless it was cancelled first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn expire_after(&self, timeout: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, this.token.cancelled()).await.is_err() {
                trace!(?timeout, "Request deadline exceeded.");
                this.expire();
            }
        })
    }

    /// Returns `true` if the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns why the signal fired, or `None` if it has not.
    pub fn reason(&self) -> Option<CancelReason> {
        match self.reason.get() {
            Some(reason) => Some(*reason),
            None if self.token.is_cancelled() => Some(CancelReason::Cancelled),
            None => None,
        }
    }

    /// Gets the `Cancellation` attached to the given extensions, if any.
    pub fn from_extensions(extensions: &Extensions) -> Option<Cancellation> {
        extensions.get::<Cancellation>().cloned()
    }

    /// Gets the `Cancellation` attached to the given request, if any.
    pub fn from_request<B>(req: &Request<B>) -> Option<Cancellation> {
        Self::from_extensions(req.extensions())
    }

    fn fire(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{CancelReason, Cancellation};

    #[test]
    fn test_unfired() {
        let cancellation = Cancellation::new();
        assert!(!cancellation.is_cancelled());
        assert_eq!(cancellation.reason(), None);
    }

    #[test]
    fn test_first_reason_wins() {
        let cancellation = Cancellation::new();
        cancellation.expire();
        cancellation.cancel();
        assert_eq!(cancellation.reason(), Some(CancelReason::DeadlineExceeded));

        let cancellation = Cancellation::new();
        cancellation.clone().cancel();
        cancellation.expire();
        assert_eq!(cancellation.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_parent_token_cancels() {
        let parent = CancellationToken::new();
        let cancellation = Cancellation::from_token(parent.child_token());
        parent.cancel();
        assert_eq!(cancellation.reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after() {
        let cancellation = Cancellation::new();
        cancellation.expire_after(Duration::from_secs(5)).await.unwrap();
        assert_eq!(cancellation.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_token_observes_signal() {
        let cancellation = Cancellation::new();
        let waiter = cancellation.token().clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        cancellation.expire();
        task.await.unwrap();
        assert!(cancellation.token().is_cancelled());
        assert_eq!(cancellation.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline() {
        let cancellation = Cancellation::new();
        let timer = cancellation.expire_after(Duration::from_secs(5));
        cancellation.cancel();
        timer.await.unwrap();
        assert_eq!(cancellation.reason(), Some(CancelReason::Cancelled));
    }
}
