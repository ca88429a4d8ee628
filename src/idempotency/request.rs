use http::{HeaderMap, HeaderName, Method};
use serde::{Deserialize, Serialize};

use crate::idempotency::coordinator::RequestState;

pub const CONCURRENT_REQUEST_STATUS: u16 = 429;
pub const CONCURRENT_REQUEST_BODY: &str = r#"{"error":"Concurrent requests detected"}"#;

/// Diagnostics the coordinator leaves on a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAnnotations {
    /// Resolved idempotency key, set only when the protocol applied.
    pub key: Option<String>,
    pub state: Option<RequestState>,
    /// Whether the lock was released after a `LockAcquired` request.
    pub lock_released: Option<bool>,
}

/// The part of a host request the coordinator is allowed to see.
pub trait RequestFacade: Send {
    fn method(&self) -> &Method;

    fn path(&self) -> &str;

    /// Looks up a header by its canonical name. Values that are not visible ASCII are
    /// reported as absent.
    fn header(&self, name: &HeaderName) -> Option<&str>;

    /// Looks up a field of the body, if the host already parsed it as JSON.
    fn body_field(&self, name: &str) -> Option<&serde_json::Value>;

    fn annotations(&self) -> &RequestAnnotations;

    fn annotations_mut(&mut self) -> &mut RequestAnnotations;
}

/// Response triple produced by a protected handler and persisted as the result entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The synthetic response returned when another request holds the lock.
    pub fn concurrent_conflict() -> Self {
        Self::new(CONCURRENT_REQUEST_STATUS, CONCURRENT_REQUEST_BODY)
            .with_header("Content-Type", "application/json")
    }

    /// Returns the first header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// `RequestFacade` over plain `http` request data.
#[derive(Debug, Clone)]
pub struct HttpRequestFacade {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
    annotations: RequestAnnotations,
}

impl HttpRequestFacade {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            path: path.into(),
            headers,
            body: None,
            annotations: RequestAnnotations::default(),
        }
    }

    pub fn from_parts(parts: &http::request::Parts) -> Self {
        Self::new(
            parts.method.clone(),
            parts.uri.path(),
            parts.headers.clone(),
        )
    }

    pub fn with_json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn into_annotations(self) -> RequestAnnotations {
        self.annotations
    }
}

impl RequestFacade for HttpRequestFacade {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &HeaderName) -> Option<&str> {
        let value = self.headers.get(name)?;
        match value.to_str() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::debug!(
                    header = %name,
                    method = %self.method,
                    path = %self.path,
                    "Ignoring header value that is not visible ASCII"
                );
                None
            }
        }
    }

    fn body_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.body.as_ref().and_then(|body| body.get(name))
    }

    fn annotations(&self) -> &RequestAnnotations {
        &self.annotations
    }

    fn annotations_mut(&mut self) -> &mut RequestAnnotations {
        &mut self.annotations
    }
}
