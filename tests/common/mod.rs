#![allow(dead_code)]

use http::{HeaderMap, HeaderValue, Method};
use idempotent_request::error::{AppError, Result};
use idempotent_request::idempotency::{
    AlwaysPolicy, CoordinatorConfig, HttpRequestFacade, IdempotencyCoordinator,
    KeyResolverConfig, MemoryStorage, StorageBackend, StoredResponse,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub fn header_config() -> CoordinatorConfig {
    CoordinatorConfig {
        keys: KeyResolverConfig {
            header_key: Some(IDEMPOTENCY_HEADER.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn coordinator_with(storage: Arc<dyn StorageBackend>, config: CoordinatorConfig) -> IdempotencyCoordinator {
    IdempotencyCoordinator::builder(storage)
        .with_policy(AlwaysPolicy)
        .with_config(config)
        .build()
        .expect("Failed to build coordinator")
}

pub fn memory_coordinator() -> (Arc<MemoryStorage>, IdempotencyCoordinator) {
    let storage = Arc::new(MemoryStorage::new());
    let coordinator = coordinator_with(storage.clone(), header_config());
    (storage, coordinator)
}

pub fn keyed_request(key: &str) -> HttpRequestFacade {
    let mut headers = HeaderMap::new();
    headers.insert("idempotency-key", HeaderValue::from_str(key).expect("Invalid header value"));
    HttpRequestFacade::new(Method::POST, "/orders", headers)
}

pub fn unkeyed_request() -> HttpRequestFacade {
    HttpRequestFacade::new(Method::POST, "/orders", HeaderMap::new())
}

/// Handler double that counts invocations.
#[derive(Clone, Default)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn ok(&self) -> Result<StoredResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StoredResponse::new(200, "ok"))
    }

    pub async fn slow_ok(&self, delay: Duration) -> Result<StoredResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(StoredResponse::new(201, "created").with_header("X-Order-Id", "42"))
    }

    pub async fn fail(&self) -> Result<StoredResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Handler(anyhow::anyhow!("downstream exploded")))
    }
}
