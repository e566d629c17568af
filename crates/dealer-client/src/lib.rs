//! Authenticated dealer API client
//!
//! Wraps a [`transport::Transport`] with bearer-token attachment,
//! single-flight token refresh, bounded retry for transient failures and a
//! typed error taxonomy. [`ApiClient`] is the entry point.

pub mod coordinator;
pub mod error;
pub mod expiry;
pub mod metrics;
pub mod pipeline;
pub mod refresh;
pub mod request;
pub mod retry;

#[cfg(test)]
mod testing;

pub use coordinator::{RefreshCoordinator, RefreshError, RefreshOutcome, RefreshTrigger};
pub use error::{ClientError, ErrorKind, Result};
pub use expiry::AuthExpiryNotifier;
pub use pipeline::{
    ApiClient, ClientConfig, DEFAULT_REQUEST_ID_HEADER, RETRY_ATTEMPT_HEADER,
};
pub use refresh::spawn_refresh_task;
pub use request::{ApiResponse, RequestDescriptor};
pub use retry::{Disposition, RetryPolicy, classify_status, parse_retry_after};
