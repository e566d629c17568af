//! reqwest-backed transport.
//!
//! Sends exactly one request per `execute` call. The per-call timeout is
//! applied to the whole exchange (connect, headers and body), and the
//! optional cancellation token races the exchange so an abort drops the
//! in-flight connection immediately.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::{Result, Transport, TransportError, TransportRequest, TransportResponse};

/// Transport over a shared `reqwest::Client` (connection pooling is the client's).
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Client with redirects disabled: a 3xx comes back to the caller as-is
    /// instead of carrying the bearer token to another location.
    pub fn try_default() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                TransportError::InvalidRequest(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { client })
    }

    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    async fn exchange(&self, request: TransportRequest) -> Result<TransportResponse> {
        let timeout = request.timeout;
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;

        debug!(status = status.as_u16(), bytes = body.len(), "exchange complete");
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn id(&self) -> &str {
        "reqwest"
    }

    fn execute(
        &self,
        mut request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>> {
        let cancel = request.cancel.take();
        Box::pin(async move {
            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(TransportError::Cancelled),
                        result = self.exchange(request) => result,
                    }
                }
                None => self.exchange(request).await,
            }
        })
    }
}

/// Classify a reqwest failure into the transport taxonomy.
fn map_reqwest_error(e: &reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}
