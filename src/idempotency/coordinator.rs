use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::idempotency::key_resolver::{KeyResolver, KeyResolverConfig};
use crate::idempotency::policy::IdempotencyPolicy;
use crate::idempotency::request::{RequestAnnotations, RequestFacade, StoredResponse};
use crate::idempotency::storage::{KeySpace, StorageBackend, DEFAULT_NAMESPACE};
use crate::observability::{get_metrics, mask_key, LatencyTimer};

/// Lock lifetime ceiling: two weeks.
pub const LOCK_TTL_CEILING_SECS: u64 = 1_209_600;

/// Branch taken by the coordinator for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Passthrough,
    CacheHit,
    LockAcquired,
    ConcurrentReject,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Passthrough => "passthrough",
            RequestState::CacheHit => "read",
            RequestState::LockAcquired => "write",
            RequestState::ConcurrentReject => "concurrent",
        }
    }
}

/// Configuration for the idempotency coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(flatten)]
    pub keys: KeyResolverConfig,
    pub namespace: String,
    /// Result entry TTL in seconds; `None` or 0 keeps results forever
    pub expire_time: Option<u64>,
    /// Lock entry TTL in seconds, capped at `LOCK_TTL_CEILING_SECS`
    pub lock_ttl: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            keys: KeyResolverConfig::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            expire_time: None,
            lock_ttl: LOCK_TTL_CEILING_SECS,
        }
    }
}

/// Request metadata recorded in a lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContext {
    pub method: String,
    pub path: String,
}

/// Value stored under the lock key while a handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub acquired_at: DateTime<Utc>,
    pub context: LockContext,
}

impl LockEntry {
    pub fn for_request<R: RequestFacade>(request: &R) -> Self {
        Self {
            acquired_at: Utc::now(),
            context: LockContext {
                method: request.method().to_string(),
                path: request.path().to_string(),
            },
        }
    }
}

/// What the coordinator did with a request and the response to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: RequestState,
    pub response: StoredResponse,
}

impl Outcome {
    fn new(state: RequestState, response: StoredResponse) -> Self {
        Self { state, response }
    }
}

/// Holds an acquired lock and releases it on every exit path.
///
/// `release` deletes the lock in place. If the guard is dropped without it (handler
/// panic, cancelled request future), the delete is spawned onto the current runtime.
struct LockGuard {
    storage: Arc<dyn StorageBackend>,
    lock_key: String,
    released: bool,
}

impl LockGuard {
    fn new(storage: Arc<dyn StorageBackend>, lock_key: String) -> Self {
        Self {
            storage,
            lock_key,
            released: false,
        }
    }

    /// Returns false if the delete failed; the lock then lives until its TTL.
    async fn release(mut self) -> bool {
        let result = self.storage.delete(&self.lock_key).await;
        self.released = true;

        match result {
            Ok(()) => true,
            Err(e) => {
                get_metrics().record_unlock_failure();
                tracing::error!(
                    lock_key = %mask_key(&self.lock_key),
                    "Failed to release idempotency lock: {}",
                    e
                );
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let storage = Arc::clone(&self.storage);
        let lock_key = std::mem::take(&mut self.lock_key);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = storage.delete(&lock_key).await {
                        get_metrics().record_unlock_failure();
                        tracing::error!(
                            lock_key = %mask_key(&lock_key),
                            "Failed to release abandoned idempotency lock: {}",
                            e
                        );
                    }
                });
            }
            Err(_) => {
                get_metrics().record_unlock_failure();
                tracing::error!(
                    lock_key = %mask_key(&lock_key),
                    "No runtime to release idempotency lock, leaving it to expire"
                );
            }
        }
    }
}

/// Runs handlers at most once per idempotency key.
///
/// All mutual exclusion goes through the storage backend's conditional set, so any
/// number of coordinator instances may share one store.
pub struct IdempotencyCoordinator {
    storage: Arc<dyn StorageBackend>,
    policy: Arc<dyn IdempotencyPolicy>,
    resolver: KeyResolver,
    keys: KeySpace,
    expire_time: Option<u64>,
    lock_ttl: u64,
}

/// Builder for `IdempotencyCoordinator`. A policy is mandatory.
pub struct CoordinatorBuilder {
    storage: Arc<dyn StorageBackend>,
    policy: Option<Arc<dyn IdempotencyPolicy>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    pub fn with_policy<P: IdempotencyPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn with_shared_policy(mut self, policy: Arc<dyn IdempotencyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<IdempotencyCoordinator> {
        let policy = self.policy.ok_or_else(|| {
            AppError::Configuration("an idempotency policy is required".to_string())
        })?;

        if self.config.lock_ttl == 0 {
            return Err(AppError::Configuration(
                "lock_ttl must be greater than zero".to_string(),
            ));
        }

        Ok(IdempotencyCoordinator {
            storage: self.storage,
            policy,
            resolver: KeyResolver::new(&self.config.keys)?,
            keys: KeySpace::new(self.config.namespace),
            expire_time: self.config.expire_time.filter(|ttl| *ttl > 0),
            lock_ttl: self.config.lock_ttl.min(LOCK_TTL_CEILING_SECS),
        })
    }
}

impl IdempotencyCoordinator {
    pub fn builder(storage: Arc<dyn StorageBackend>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            storage,
            policy: None,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn key_resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Whether the policy accepts the request. Only method, path and headers are consulted.
    pub fn policy_applies<R: RequestFacade>(&self, request: &R) -> bool {
        self.policy.should_apply(request)
    }

    /// The key the protocol would run under, or `None` if the request passes through.
    pub fn applicable_key<R: RequestFacade>(&self, request: &R) -> Option<String> {
        let key = self.resolver.resolve(request);
        if key.trim().is_empty() || !self.policy.should_apply(request) {
            None
        } else {
            Some(key)
        }
    }

    /// Runs `handler` outside the protocol and hands back its output untouched.
    pub async fn passthrough<R, F, Fut, T>(&self, request: &mut R, handler: F) -> T
    where
        R: RequestFacade,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        *request.annotations_mut() = RequestAnnotations {
            state: Some(RequestState::Passthrough),
            ..Default::default()
        };
        let timer = LatencyTimer::new();
        let output = handler().await;
        get_metrics().record_request(RequestState::Passthrough.as_str(), timer.elapsed_ms());
        output
    }

    /// Processes one request: replays a stored result, runs `handler` under the lock,
    /// or rejects the request while another one with the same key is in flight.
    ///
    /// Errors from storage and from `handler` are returned unchanged; the lock is
    /// released before they are.
    pub async fn process<R, F, Fut>(&self, request: &mut R, handler: F) -> Result<Outcome>
    where
        R: RequestFacade,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse>>,
    {
        let Some(key) = self.applicable_key(request) else {
            let response = self.passthrough(request, handler).await?;
            return Ok(Outcome::new(RequestState::Passthrough, response));
        };

        *request.annotations_mut() = RequestAnnotations {
            key: Some(key.clone()),
            ..Default::default()
        };
        let timer = LatencyTimer::new();

        match self.process_keyed(&key, request, handler).await {
            Ok(outcome) => {
                request.annotations_mut().state = Some(outcome.state);
                self.instrument(&key, request, &outcome, &timer);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(
                    key = %mask_key(&key),
                    method = %request.method(),
                    path = request.path(),
                    storage_error = e.is_storage_error(),
                    "Idempotent request failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn process_keyed<R, F, Fut>(
        &self,
        key: &str,
        request: &mut R,
        handler: F,
    ) -> Result<Outcome>
    where
        R: RequestFacade,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse>>,
    {
        if let Some(response) = self.read(key).await? {
            return Ok(Outcome::new(RequestState::CacheHit, response));
        }

        match self.write(key, request, handler).await? {
            Some(response) => Ok(Outcome::new(RequestState::LockAcquired, response)),
            None => Ok(Outcome::new(
                RequestState::ConcurrentReject,
                StoredResponse::concurrent_conflict(),
            )),
        }
    }

    /// Fetches the stored result for `key`, if any.
    pub async fn read(&self, key: &str) -> Result<Option<StoredResponse>> {
        let stored = self.storage.get(&self.keys.result_key(key)).await?;
        match stored {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Runs the handler under the lock. Returns `None` if another request holds it.
    async fn write<R, F, Fut>(
        &self,
        key: &str,
        request: &mut R,
        handler: F,
    ) -> Result<Option<StoredResponse>>
    where
        R: RequestFacade,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse>>,
    {
        let entry = LockEntry::for_request(&*request);
        let Some(guard) = self.lock(key, &entry).await? else {
            return Ok(None);
        };
        request.annotations_mut().state = Some(RequestState::LockAcquired);

        let result = match handler().await {
            Ok(response) => self.store_result(key, &response).await.map(|()| response),
            Err(e) => Err(e),
        };

        let released = guard.release().await;
        request.annotations_mut().lock_released = Some(released);

        result.map(Some)
    }

    async fn lock(&self, key: &str, entry: &LockEntry) -> Result<Option<LockGuard>> {
        let lock_key = self.keys.lock_key(key);
        let entry = serde_json::to_string(entry)?;

        let acquired = self
            .storage
            .conditional_set(&lock_key, &entry, Some(self.lock_ttl))
            .await?;

        if acquired {
            Ok(Some(LockGuard::new(Arc::clone(&self.storage), lock_key)))
        } else {
            tracing::debug!(key = %mask_key(key), "Idempotency lock already held");
            Ok(None)
        }
    }

    async fn store_result(&self, key: &str, response: &StoredResponse) -> Result<()> {
        let payload = serde_json::to_string(response)?;
        let created = self
            .storage
            .conditional_set(&self.keys.result_key(key), &payload, self.expire_time)
            .await?;

        if !created {
            // Only reachable if the lock expired while the handler was still running.
            get_metrics().record_result_write_conflict();
            tracing::warn!(
                key = %mask_key(key),
                "Result entry already present, keeping the original"
            );
        }

        Ok(())
    }

    fn instrument<R: RequestFacade>(
        &self,
        key: &str,
        request: &R,
        outcome: &Outcome,
        timer: &LatencyTimer,
    ) {
        let duration_ms = timer.elapsed_ms();
        get_metrics().record_request(outcome.state.as_str(), duration_ms);

        tracing::info!(
            target: "idempotent_request",
            key = %mask_key(key),
            branch = outcome.state.as_str(),
            method = %request.method(),
            path = request.path(),
            status = outcome.response.status,
            duration_ms,
            "Idempotent request processed"
        );
    }
}
