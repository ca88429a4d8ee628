use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::idempotency::{
    CoordinatorConfig, IdempotencyCoordinator, KeyResolverConfig, PolicySettings,
    StorageBackend, DEFAULT_NAMESPACE, LOCK_TTL_CEILING_SECS,
};
use crate::observability::{LogConfig, LogFormat};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisSettings {
    /// Falls back to in-process storage when unset
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ApplicationSettings {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: LogFormat::from(self.log_format.as_str()),
            ..Default::default()
        }
    }
}

/// The `[idempotency]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub policy: Option<PolicySettings>,
    pub header_key: Option<String>,
    pub body_key: Option<String>,
    pub namespace: String,
    pub expire_time: Option<u64>,
    pub lock_ttl: u64,
    pub legacy_fallback: bool,
    pub trace_header: String,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            policy: None,
            header_key: None,
            body_key: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            expire_time: None,
            lock_ttl: LOCK_TTL_CEILING_SECS,
            legacy_fallback: false,
            trace_header: KeyResolverConfig::default().trace_header,
        }
    }
}

impl IdempotencySettings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            keys: KeyResolverConfig {
                header_key: self.header_key.clone(),
                body_key: self.body_key.clone(),
                legacy_fallback: self.legacy_fallback,
                trace_header: self.trace_header.clone(),
            },
            namespace: self.namespace.clone(),
            expire_time: self.expire_time,
            lock_ttl: self.lock_ttl,
        }
    }

    /// Builds a coordinator over `storage`. Fails if no policy is configured.
    pub fn build_coordinator(
        &self,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<IdempotencyCoordinator> {
        let policy = self
            .policy
            .as_ref()
            .ok_or_else(|| AppError::Configuration("idempotency.policy is required".to_string()))?
            .build()?;

        IdempotencyCoordinator::builder(storage)
            .with_shared_policy(policy)
            .with_config(self.coordinator_config())
            .build()
    }
}

impl Settings {
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Loads settings from an inline TOML document.
    pub fn from_toml(contents: &str) -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
