//! Request descriptors and decoded responses
//!
//! A `RequestDescriptor` is what callers submit: method, path relative to
//! the API base URL, headers, optional body, optional timeout and
//! cancellation. The pipeline never mutates it; each attempt is prepared
//! from a fresh copy.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use transport::{
    Bytes, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, TransportResponse, header,
};

use crate::error::{ClientError, ErrorKind, Result};

/// Caller-supplied description of one logical request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a header from strings, rejecting invalid names or values.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            ClientError::new(ErrorKind::ClientError, format!("invalid header name {name:?}: {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            ClientError::new(ErrorKind::ClientError, format!("invalid header value: {e}"))
        })?;
        Ok(self.header(name, value))
    }

    /// Serialize `body` as the JSON request body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| {
            ClientError::new(ErrorKind::ClientError, format!("encoding request body: {e}"))
        })?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(bytes.into());
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>, content_type: HeaderValue) -> Self {
        self.headers.insert(header::CONTENT_TYPE, content_type);
        self.body = Some(body.into());
        self
    }

    /// Per-call timeout; also bounds this request's wait on an in-flight refresh.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// GET/HEAD/OPTIONS/PUT/DELETE. Retries of other methods may duplicate side effects.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
        )
    }
}

/// A successful response, body fully read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
}

impl ApiResponse {
    pub(crate) fn from_transport(response: TransportResponse, request_id: String) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            request_id,
        }
    }

    /// Decode the body according to its content type.
    ///
    /// Empty bodies, 204 and 304 decode from JSON `null`; `text/*` bodies
    /// decode from a JSON string; everything else is parsed as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let decoded = if self.body.is_empty()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            serde_json::from_value(serde_json::Value::Null)
        } else if self.is_text() {
            serde_json::from_value(serde_json::Value::String(self.text()))
        } else {
            serde_json::from_slice(&self.body)
        };

        decoded.map_err(|e| {
            ClientError::new(ErrorKind::DecodeError, format!("decoding response body: {e}"))
                .with_status(self.status.as_u16())
                .with_request_id(self.request_id.clone())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn is_text(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/"))
    }
}

/// Best human-readable message from an error response body.
///
/// Looks at JSON `message`, `error.message` and `error` fields, then the
/// trimmed text body, then the status reason.
pub(crate) fn server_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        let candidate = json
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| json.pointer("/error/message").and_then(|m| m.as_str()))
            .or_else(|| json.get("error").and_then(|m| m.as_str()));
        if let Some(message) = candidate
            && !message.trim().is_empty()
        {
            return message.trim().to_owned();
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if !text.is_empty() && !text.starts_with('{') {
        return text.chars().take(512).collect();
    }

    status
        .canonical_reason()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}
