use http::HeaderName;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::idempotency::request::RequestFacade;

/// Configuration for idempotency key resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyResolverConfig {
    /// Header carrying the key; takes priority over `body_key`
    pub header_key: Option<String>,
    /// Field of the parsed JSON body carrying the key
    pub body_key: Option<String>,
    /// Fall back to the trace header, then a random key, when no source is configured
    pub legacy_fallback: bool,
    /// Header consulted by the legacy fallback
    pub trace_header: String,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self {
            header_key: None,
            body_key: None,
            legacy_fallback: false,
            trace_header: "x-request-id".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeySource {
    Header(HeaderName),
    BodyField(String),
    Unconfigured,
}

/// Derives the idempotency key of a request from the configured source.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    source: KeySource,
    trace_header: Option<HeaderName>,
}

impl KeyResolver {
    pub fn new(config: &KeyResolverConfig) -> Result<Self> {
        let source = if let Some(name) = non_blank(config.header_key.as_deref()) {
            KeySource::Header(parse_header_name(name)?)
        } else if let Some(field) = non_blank(config.body_key.as_deref()) {
            KeySource::BodyField(field.to_string())
        } else {
            KeySource::Unconfigured
        };

        let trace_header = if config.legacy_fallback {
            let name = non_blank(Some(config.trace_header.as_str())).ok_or_else(|| {
                AppError::Configuration("trace_header must be set for legacy_fallback".to_string())
            })?;
            Some(parse_header_name(name)?)
        } else {
            None
        };

        Ok(Self {
            source,
            trace_header,
        })
    }

    /// The body field the key is read from, if that is the configured source.
    pub fn body_key(&self) -> Option<&str> {
        match &self.source {
            KeySource::BodyField(field) => Some(field),
            _ => None,
        }
    }

    /// Resolves the key for a request. An empty string means no key applies.
    pub fn resolve<R: RequestFacade + ?Sized>(&self, request: &R) -> String {
        match &self.source {
            KeySource::Header(name) => request.header(name).map(str::to_owned).unwrap_or_default(),
            KeySource::BodyField(field) => request
                .body_field(field)
                .and_then(scalar_to_key)
                .unwrap_or_default(),
            KeySource::Unconfigured => self.fallback(request),
        }
    }

    /// Legacy behavior: every request without a trace header gets a distinct key, so
    /// retries are never deduplicated.
    fn fallback<R: RequestFacade + ?Sized>(&self, request: &R) -> String {
        match &self.trace_header {
            Some(name) => request
                .header(name)
                .map(str::to_owned)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            None => String::new(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| AppError::Configuration(format!("Invalid header name '{}': {}", name, e)))
}

fn scalar_to_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
