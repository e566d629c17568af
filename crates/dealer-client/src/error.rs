//! Error taxonomy surfaced to callers of the request pipeline
//!
//! Only terminal outcomes cross the pipeline boundary. Every failure carries
//! a `kind` callers can match on; `status`, `retry_after` and `request_id`
//! are filled in when known.

use std::fmt;
use std::time::Duration;

/// What went wrong, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport unreachable after the transient retry budget
    NetworkError,
    /// Per-call deadline exceeded after the transient retry budget, or a
    /// caller's wait for a refresh timed out
    TimeoutError,
    /// Refresh failed, no credentials, or a resend was rejected again
    AuthExpired,
    /// 429 after the transient retry budget
    RateLimited,
    /// 5xx after the transient retry budget
    ServerError,
    /// 4xx other than 401/429; never retried
    ClientError,
    /// Caller-initiated abort
    Cancelled,
    /// 2xx whose body could not be decoded into the requested type
    DecodeError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::AuthExpired => "AUTH_EXPIRED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::DecodeError => "DECODE_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of one logical request.
///
/// `attempts` counts transport calls made for the request (refresh calls
/// excluded). For non-idempotent methods a transient failure with
/// `attempts > 1` means the server may have applied the request already.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub request_id: Option<String>,
    pub attempts: u32,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
            request_id: None,
            attempts: 0,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled by caller")
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ClientError>;
