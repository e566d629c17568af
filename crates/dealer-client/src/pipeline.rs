//! Request pipeline
//!
//! The only surface callers use. Each logical request goes through:
//!
//! 1. proactive refresh if the stored token is about to expire
//! 2. attach the current bearer token (none if logged out)
//! 3. dispatch through the `Transport`
//! 4. classify: success returns, 401 refreshes once and resends, 429/5xx and
//!    network/timeout failures retry under one bounded budget, anything else
//!    is terminal
//!
//! Only the terminal outcome leaves this module.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dealer_auth::{CredentialPair, CredentialStore, DEFAULT_REFRESH_PATH, now_millis};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use transport::{
    HeaderName, HeaderValue, Transport, TransportError, TransportRequest, TransportResponse,
    header,
};
use uuid::Uuid;

use crate::coordinator::{RefreshCoordinator, RefreshOutcome, RefreshTrigger};
use crate::error::{ClientError, ErrorKind, Result};
use crate::expiry::AuthExpiryNotifier;
use crate::metrics;
use crate::request::{ApiResponse, RequestDescriptor, server_message};
use crate::retry::{Disposition, RetryPolicy, classify_status, parse_retry_after};

/// Header carrying the 1-based resend number on retried attempts.
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// Default header for the per-request id.
pub const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";

/// Static settings for one API client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheme, host and optional path prefix, e.g. `https://api.dealer.example/v1`
    pub base_url: String,
    /// Refresh endpoint, relative to `base_url` or absolute
    pub refresh_path: String,
    /// Per-call transport timeout, also the bound on waiting for a refresh
    pub timeout: Duration,
    /// Refresh proactively when the token expires within this window
    pub refresh_skew: Duration,
    pub request_id_header: HeaderName,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            timeout: Duration::from_secs(30),
            refresh_skew: Duration::from_secs(60),
            request_id_header: HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER),
            retry: RetryPolicy::default(),
        }
    }

    /// Absolute URL for `path`. Absolute URLs pass through unchanged.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn refresh_url(&self) -> String {
        self.url_for(&self.refresh_path)
    }
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    expiry: Arc<AuthExpiryNotifier>,
    coordinator: Arc<RefreshCoordinator>,
}

/// Authenticated API client. Cheap to clone; clones share credentials and
/// the refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

/// A failure eligible for another attempt.
struct Transient {
    error: ClientError,
    reason: &'static str,
    retry_after: Option<Duration>,
}

impl ApiClient {
    /// Build a client over `store`. If the store already holds credentials
    /// (restored from disk) the expiry notification is armed.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
    ) -> Self {
        let expiry = Arc::new(AuthExpiryNotifier::new(store.is_authenticated()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            expiry.clone(),
            config.refresh_url(),
            config.timeout,
            config.refresh_skew,
        ));
        info!(
            base_url = %config.base_url,
            transport = transport.id(),
            authenticated = store.is_authenticated(),
            "api client ready"
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                store,
                expiry,
                coordinator,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.inner.coordinator
    }

    /// Install a credential pair (login).
    pub fn set_credentials(&self, pair: CredentialPair) {
        self.inner.store.set(pair);
        self.inner.expiry.arm();
        info!("credentials installed");
    }

    /// Forget credentials (logout). Does not fire the expiry notification.
    pub fn clear_credentials(&self) {
        self.inner.expiry.disarm();
        self.inner.store.clear();
        info!("credentials cleared");
    }

    pub fn credentials(&self) -> Option<CredentialPair> {
        self.inner.store.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.store.is_authenticated()
    }

    /// Register a callback for the transition to unauthenticated.
    pub fn on_auth_expired(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.expiry.subscribe(callback);
    }

    /// Refresh now if the stored token expires within the skew window.
    /// Returns whether a refresh was needed.
    pub async fn refresh_if_expiring(&self) -> Result<bool> {
        if !self.needs_proactive_refresh() {
            return Ok(false);
        }
        self.inner
            .coordinator
            .ensure_fresh_or_refresh(RefreshTrigger::Proactive)
            .await
            .map(|_| true)
            .map_err(|e| ClientError::new(ErrorKind::AuthExpired, e.to_string()))
    }

    /// Exchange the refresh token now, regardless of the expiry estimate.
    pub async fn force_refresh(&self) -> Result<CredentialPair> {
        let current = self.inner.store.get();
        let rejected = current.as_ref().map(|p| &p.access_token);
        self.inner
            .coordinator
            .refresh_after_rejection(rejected)
            .await
            .map_err(|e| ClientError::new(ErrorKind::AuthExpired, e.to_string()))
    }

    /// Send a request and decode the response body into `T`.
    pub async fn send<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        self.send_raw(descriptor).await?.json()
    }

    /// Send a request and return the undecoded response.
    pub async fn send_raw(&self, descriptor: RequestDescriptor) -> Result<ApiResponse> {
        let request_id = descriptor
            .headers()
            .get(&self.inner.config.request_id_header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("req_{}", Uuid::new_v4().simple()));

        let span = info_span!(
            "api_request",
            request_id = %request_id,
            method = %descriptor.method(),
            path = descriptor.path(),
        );
        let started = Instant::now();
        let result = self.execute(&descriptor, request_id).instrument(span).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind.as_str(),
        };
        metrics::record_request(outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        mut request_id: String,
    ) -> Result<ApiResponse> {
        let inner = &self.inner;
        let policy = &inner.config.retry;
        let cancel = descriptor.cancellation();
        let timeout = descriptor.timeout_override().unwrap_or(inner.config.timeout);

        if self.needs_proactive_refresh() {
            debug!("access token expiring soon, refreshing before send");
            let refresh = inner
                .coordinator
                .ensure_fresh_or_refresh(RefreshTrigger::Proactive);
            if let Err(e) = await_refresh(refresh, cancel, timeout).await {
                return Err(e.with_request_id(request_id));
            }
        }

        let mut attempts: u32 = 0;
        let mut retries: u32 = 0;
        let mut auth_retried = false;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(ClientError::cancelled()
                    .with_request_id(request_id)
                    .with_attempts(attempts));
            }

            let credentials = inner.store.get();
            let request = self
                .prepare(descriptor, credentials.as_ref(), &request_id, attempts, timeout)
                .map_err(|e| e.with_request_id(request_id.clone()).with_attempts(attempts))?;
            attempts += 1;
            debug!(attempt = attempts, has_token = credentials.is_some(), "dispatching");

            let transient = match inner.transport.execute(request).await {
                Err(TransportError::Cancelled) => {
                    debug!(attempt = attempts, "request cancelled");
                    return Err(ClientError::cancelled()
                        .with_request_id(request_id)
                        .with_attempts(attempts));
                }
                Err(TransportError::InvalidRequest(message)) => {
                    return Err(ClientError::new(ErrorKind::ClientError, message)
                        .with_request_id(request_id)
                        .with_attempts(attempts));
                }
                Err(TransportError::Timeout(after)) => Transient {
                    error: ClientError::new(
                        ErrorKind::TimeoutError,
                        format!("request timed out after {after:?}"),
                    ),
                    reason: "timeout",
                    retry_after: None,
                },
                Err(TransportError::Network(message)) => Transient {
                    error: ClientError::new(ErrorKind::NetworkError, message),
                    reason: "network",
                    retry_after: None,
                },
                Ok(response) => {
                    if let Some(echoed) = self.echoed_request_id(&response) {
                        request_id = echoed;
                    }
                    let status = response.status;

                    match classify_status(status) {
                        Disposition::Success => {
                            debug!(attempt = attempts, status = status.as_u16(), "request succeeded");
                            return Ok(ApiResponse::from_transport(response, request_id));
                        }
                        Disposition::Unauthorized if auth_retried => {
                            // Another caller may have refreshed past the rejected token
                            let ended = credentials
                                .as_ref()
                                .is_some_and(|p| inner.coordinator.expire_if_current(&p.access_token));
                            if ended {
                                warn!(attempt = attempts, "refreshed token rejected, session expired");
                            } else {
                                debug!(attempt = attempts, "stale token rejected after refresh");
                            }
                            return Err(ClientError::new(
                                ErrorKind::AuthExpired,
                                "request rejected after token refresh",
                            )
                            .with_status(status.as_u16())
                            .with_request_id(request_id)
                            .with_attempts(attempts));
                        }
                        Disposition::Unauthorized => {
                            auth_retried = true;
                            debug!(attempt = attempts, "access token rejected, refreshing");
                            let rejected = credentials.as_ref().map(|p| &p.access_token);
                            let refresh = inner.coordinator.refresh_after_rejection(rejected);
                            if let Err(e) = await_refresh(refresh, cancel, timeout).await {
                                let e = if e.kind == ErrorKind::AuthExpired {
                                    e.with_status(status.as_u16())
                                } else {
                                    e
                                };
                                return Err(e.with_request_id(request_id).with_attempts(attempts));
                            }
                            continue;
                        }
                        Disposition::ClientError => {
                            let message = server_message(status, &response.body);
                            debug!(status = status.as_u16(), %message, "client error");
                            return Err(ClientError::new(ErrorKind::ClientError, message)
                                .with_status(status.as_u16())
                                .with_request_id(request_id)
                                .with_attempts(attempts));
                        }
                        Disposition::RateLimited => Transient {
                            error: ClientError::new(
                                ErrorKind::RateLimited,
                                server_message(status, &response.body),
                            )
                            .with_status(status.as_u16()),
                            reason: "rate_limited",
                            retry_after: parse_retry_after(&response.headers),
                        },
                        Disposition::ServerError => Transient {
                            error: ClientError::new(
                                ErrorKind::ServerError,
                                server_message(status, &response.body),
                            )
                            .with_status(status.as_u16()),
                            reason: "server_error",
                            retry_after: parse_retry_after(&response.headers),
                        },
                    }
                }
            };

            let Transient {
                error,
                reason,
                retry_after,
            } = transient;
            let error = error.with_request_id(request_id.clone()).with_attempts(attempts);

            if let Some(wait) = retry_after
                && wait > policy.max_retry_after
            {
                warn!(
                    retry_after_secs = wait.as_secs(),
                    "server asked for a longer wait than allowed, giving up"
                );
                return Err(error.with_retry_after(Some(wait)));
            }

            if !policy.allows_another(retries + 1) {
                let error = if error.kind == ErrorKind::RateLimited {
                    error.with_retry_after(Some(policy.delay_for(retries, retry_after)))
                } else {
                    error.with_retry_after(retry_after)
                };
                warn!(attempt = attempts, kind = %error.kind, "retry budget exhausted");
                return Err(error);
            }

            let delay = policy.delay_for(retries, retry_after);
            retries += 1;
            warn!(
                attempt = attempts,
                reason,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "transient failure, retrying"
            );
            metrics::record_retry(reason);

            if !sleep_unless_cancelled(delay, cancel).await {
                return Err(ClientError::cancelled()
                    .with_request_id(request_id)
                    .with_attempts(attempts));
            }
        }
    }

    /// Build one attempt from the caller's descriptor, which is never mutated.
    fn prepare(
        &self,
        descriptor: &RequestDescriptor,
        credentials: Option<&CredentialPair>,
        request_id: &str,
        attempts_made: u32,
        timeout: Duration,
    ) -> Result<TransportRequest> {
        let config = &self.inner.config;
        let mut request = TransportRequest::new(
            descriptor.method().clone(),
            config.url_for(descriptor.path()),
            timeout,
        );
        request.headers = descriptor.headers().clone();
        request.headers.remove(header::AUTHORIZATION);

        if let Some(pair) = credentials
            && !pair.access_token.is_empty()
        {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {}", pair.access_token.expose()))
                .map_err(|_| {
                    ClientError::new(
                        ErrorKind::ClientError,
                        "stored access token is not a valid header value",
                    )
                })?;
            bearer.set_sensitive(true);
            request.headers.insert(header::AUTHORIZATION, bearer);
        }

        let id_value = HeaderValue::from_str(request_id).map_err(|_| {
            ClientError::new(ErrorKind::ClientError, "request id is not a valid header value")
        })?;
        request
            .headers
            .insert(config.request_id_header.clone(), id_value);

        if attempts_made > 0 {
            request.headers.insert(
                HeaderName::from_static(RETRY_ATTEMPT_HEADER),
                HeaderValue::from(attempts_made),
            );
        }

        request.body = descriptor.body_bytes().cloned();
        request.cancel = descriptor.cancellation().cloned();
        Ok(request)
    }

    fn needs_proactive_refresh(&self) -> bool {
        self.inner.store.get().is_some_and(|pair| {
            pair.has_refresh_token()
                && pair.expires_within(self.inner.config.refresh_skew, now_millis())
        })
    }

    fn echoed_request_id(&self, response: &TransportResponse) -> Option<String> {
        response
            .headers
            .get(&self.inner.config.request_id_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.config.base_url)
            .field("transport", &self.inner.transport.id())
            .field("store", &self.inner.store)
            .finish()
    }
}

/// Wait for a refresh outcome, bounded by this caller's timeout and cancellation.
/// Giving up here leaves the refresh itself running.
async fn await_refresh(
    refresh: impl Future<Output = RefreshOutcome>,
    cancel: Option<&CancellationToken>,
    timeout: Duration,
) -> Result<CredentialPair> {
    let wait = tokio::time::timeout(timeout, refresh);
    let outcome = match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ClientError::cancelled()),
            outcome = wait => outcome,
        },
        None => wait.await,
    };

    match outcome {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(e)) => Err(ClientError::new(ErrorKind::AuthExpired, e.to_string())),
        Err(_) => Err(ClientError::new(
            ErrorKind::TimeoutError,
            format!("timed out after {timeout:?} waiting for token refresh"),
        )),
    }
}

/// Sleep for `delay`; false if cancelled first.
async fn sleep_unless_cancelled(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
