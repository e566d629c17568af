//! Scripted transport for unit tests

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use transport::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Transport, TransportError,
    TransportRequest, TransportResponse, header,
};

/// What the scripted server answers, and after how long.
pub(crate) struct Reply {
    delay: Duration,
    result: transport::Result<TransportResponse>,
}

impl Reply {
    pub(crate) fn status(code: u16) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(TransportResponse::new(StatusCode::from_u16(code).unwrap())),
        }
    }

    pub(crate) fn json(code: u16, body: serde_json::Value) -> Self {
        Self::status(code)
            .header("content-type", "application/json")
            .body(body.to_string())
    }

    pub(crate) fn error(error: TransportError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub(crate) fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(response) = self.result.as_mut() {
            response.headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self
    }

    pub(crate) fn body(mut self, body: impl Into<String>) -> Self {
        if let Ok(response) = self.result.as_mut() {
            response.body = body.into().into();
        }
        self
    }

    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One observed transport call.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub url: String,
    pub method: Method,
    pub bearer: Option<String>,
    pub headers: HeaderMap,
    pub at: Instant,
}

impl Call {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

type Handler = dyn Fn(&TransportRequest, usize) -> Reply + Send + Sync;

/// Transport whose replies come from a closure.
///
/// The handler gets the request and how many earlier calls went to the same
/// URL. Delays honour the request's timeout and cancellation token the way
/// the reqwest transport does.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(&TransportRequest, usize) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.url.ends_with(path))
            .cloned()
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn execute(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<TransportResponse>> + Send + '_>> {
        let index = {
            let mut calls = self.calls.lock();
            let index = calls.iter().filter(|c| c.url == request.url).count();
            calls.push(Call {
                url: request.url.clone(),
                method: request.method.clone(),
                bearer: request.bearer_token().map(str::to_owned),
                headers: request.headers.clone(),
                at: Instant::now(),
            });
            index
        };
        let reply = (self.handler)(&request, index);
        let timeout = request.timeout;
        let cancel = request.cancel.clone();

        Box::pin(async move {
            let exchange = async move {
                if reply.delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(TransportError::Timeout(timeout));
                }
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                reply.result
            };
            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TransportError::Cancelled),
                    result = exchange => result,
                },
                None => exchange.await,
            }
        })
    }
}

/// `{"accessToken": .., "refreshToken": ..}` refresh reply.
pub(crate) fn token_reply(access: &str, refresh: &str) -> Reply {
    Reply::json(
        200,
        serde_json::json!({"accessToken": access, "refreshToken": refresh}),
    )
}

pub(crate) fn has_header(call: &Call, name: header::HeaderName) -> bool {
    call.headers.contains_key(name)
}
