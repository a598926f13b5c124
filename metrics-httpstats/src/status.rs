use std::{error::Error, fmt, io};

use http::StatusCode;

use crate::cancel::{CancelReason, Cancellation};

/// Coarse classification of how a request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Completed with a 2xx status.
    Ok,

    /// Completed with any other status.
    Error,

    /// The request's deadline passed.
    Timeout,

    /// The request was cancelled.
    Cancelled,
}

impl Outcome {
    /// Tag value for this outcome.
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
            Outcome::Timeout => "timeout",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a request that was dropped before it completed.
///
/// A fired cancellation signal is honored as in [`classify`]; otherwise the request was abandoned by
/// whoever was waiting on it, and counts as cancelled.
pub(crate) fn classify_abandoned(cancellation: Option<&Cancellation>) -> Outcome {
    match cancellation.and_then(Cancellation::reason) {
        Some(CancelReason::DeadlineExceeded) => Outcome::Timeout,
        _ => Outcome::Cancelled,
    }
}

/// Classifies a request given its cancellation signal and final status.
///
/// A fired cancellation signal takes precedence over the status code.
pub fn classify(cancellation: Option<&Cancellation>, status: StatusCode) -> Outcome {
    match cancellation.and_then(Cancellation::reason) {
        Some(CancelReason::DeadlineExceeded) => Outcome::Timeout,
        Some(CancelReason::Cancelled) => Outcome::Cancelled,
        None if status.is_success() => Outcome::Ok,
        None => Outcome::Error,
    }
}

/// Maps a transport-level error to a synthetic status code for tagging.
///
/// Cancellations and timeouts map to `504 Gateway Timeout`, everything else to `502 Bad Gateway`.
/// A request counts as timed out if its cancellation signal fired, or if the error, or any of its
/// sources, is a Tokio or Tower timer elapsing or an I/O error of kind [`io::ErrorKind::TimedOut`].
pub fn error_to_status_code(
    error: &(dyn Error + 'static),
    cancellation: Option<&Cancellation>,
) -> StatusCode {
    if cancellation.is_some_and(Cancellation::is_cancelled) {
        return StatusCode::GATEWAY_TIMEOUT;
    }

    let mut current = Some(error);
    while let Some(error) = current {
        let timed_out = error.is::<tokio::time::error::Elapsed>()
            || error.is::<tower::timeout::error::Elapsed>()
            || error.downcast_ref::<io::Error>().is_some_and(|e| e.kind() == io::ErrorKind::TimedOut);
        if timed_out {
            return StatusCode::GATEWAY_TIMEOUT;
        }
        current = error.source();
    }

    StatusCode::BAD_GATEWAY
}
