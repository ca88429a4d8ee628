use http::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::idempotency::request::RequestFacade;

/// Decides whether a request goes through the idempotency protocol.
pub trait IdempotencyPolicy: Send + Sync {
    fn should_apply(&self, request: &dyn RequestFacade) -> bool;
}

impl<F> IdempotencyPolicy for F
where
    F: Fn(&dyn RequestFacade) -> bool + Send + Sync,
{
    fn should_apply(&self, request: &dyn RequestFacade) -> bool {
        self(request)
    }
}

/// Applies to every request that carries a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPolicy;

impl IdempotencyPolicy for AlwaysPolicy {
    fn should_apply(&self, _request: &dyn RequestFacade) -> bool {
        true
    }
}

/// Never applies. The explicit way to turn the protocol off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPolicy;

impl IdempotencyPolicy for DisabledPolicy {
    fn should_apply(&self, _request: &dyn RequestFacade) -> bool {
        false
    }
}

/// Applies to a fixed set of HTTP methods.
#[derive(Debug, Clone)]
pub struct MethodPolicy {
    methods: Vec<Method>,
}

impl MethodPolicy {
    pub fn new(methods: impl IntoIterator<Item = Method>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
        }
    }

    /// POST, PUT, PATCH and DELETE.
    pub fn mutating() -> Self {
        Self::new([Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
    }
}

impl IdempotencyPolicy for MethodPolicy {
    fn should_apply(&self, request: &dyn RequestFacade) -> bool {
        self.methods.contains(request.method())
    }
}

/// Applies to requests whose path starts with one of the prefixes.
#[derive(Debug, Clone)]
pub struct PathPrefixPolicy {
    prefixes: Vec<String>,
}

impl PathPrefixPolicy {
    pub fn new<S: Into<String>>(prefixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl IdempotencyPolicy for PathPrefixPolicy {
    fn should_apply(&self, request: &dyn RequestFacade) -> bool {
        let path = request.path();
        self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Applies only when every inner policy applies.
pub struct AllOf {
    policies: Vec<Arc<dyn IdempotencyPolicy>>,
}

impl AllOf {
    pub fn new(policies: Vec<Arc<dyn IdempotencyPolicy>>) -> Self {
        Self { policies }
    }
}

impl IdempotencyPolicy for AllOf {
    fn should_apply(&self, request: &dyn RequestFacade) -> bool {
        self.policies.iter().all(|policy| policy.should_apply(request))
    }
}

/// Policy as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicySettings {
    Always,
    Disabled,
    Methods {
        #[serde(default = "default_methods")]
        methods: Vec<String>,
    },
    PathPrefix {
        prefixes: Vec<String>,
    },
}

fn default_methods() -> Vec<String> {
    ["POST", "PUT", "PATCH", "DELETE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

impl PolicySettings {
    pub fn build(&self) -> Result<Arc<dyn IdempotencyPolicy>> {
        let policy: Arc<dyn IdempotencyPolicy> = match self {
            PolicySettings::Always => Arc::new(AlwaysPolicy),
            PolicySettings::Disabled => Arc::new(DisabledPolicy),
            PolicySettings::Methods { methods } => {
                let methods = methods
                    .iter()
                    .map(|m| {
                        Method::from_bytes(m.trim().to_uppercase().as_bytes()).map_err(|e| {
                            AppError::Configuration(format!("Invalid HTTP method '{}': {}", m, e))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(MethodPolicy::new(methods))
            }
            PolicySettings::PathPrefix { prefixes } => {
                Arc::new(PathPrefixPolicy::new(prefixes.iter().cloned()))
            }
        };
        Ok(policy)
    }
}
