use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::observability::{get_metrics, LatencyTimer};

pub const DEFAULT_NAMESPACE: &str = "idempotency_keys";

/// Atomic conditional-write key/value storage shared by every coordinator instance.
///
/// Keys handed to a backend are already namespaced; backends store them as-is.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stores `value` only if `key` is absent. Returns true iff this call created the entry.
    /// A TTL of `None` or zero means the entry never expires.
    async fn conditional_set(&self, key: &str, value: &str, ttl_seconds: Option<u64>)
        -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

fn effective_ttl(ttl_seconds: Option<u64>) -> Option<u64> {
    ttl_seconds.filter(|ttl| *ttl > 0)
}

/// Builds the store keys for lock and result entries under one namespace.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn result_key(&self, key: &str) -> String {
        self.namespaced(key)
    }

    pub fn lock_key(&self, key: &str) -> String {
        self.namespaced(&format!("lock:{}", key.trim()))
    }

    fn namespaced(&self, key: &str) -> String {
        let key = key.trim();
        if self.namespace.is_empty() {
            key.to_lowercase()
        } else {
            format!("{}:{}", self.namespace, key).to_lowercase()
        }
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Redis-backed storage using `SET NX EX`, `GET` and `DEL`.
#[derive(Clone)]
pub struct RedisStorage {
    client: redis::Client,
}

impl RedisStorage {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(AppError::Redis)?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::StorageUnavailable(format!("Redis connection failed: {}", e)))
    }

    fn record<T>(operation: &str, timer: &LatencyTimer, result: &Result<T>) {
        get_metrics().record_storage_operation(operation, timer.elapsed_ms(), result.is_ok());
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result: Result<bool> = async {
            let mut conn = self.connection().await?;

            let mut options =
                redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX);
            if let Some(ttl) = effective_ttl(ttl_seconds) {
                options = options.with_expiration(redis::SetExpiry::EX(ttl as usize));
            }

            let reply: Option<String> = conn
                .set_options(key, value, options)
                .await
                .map_err(AppError::Redis)?;

            Ok(reply.is_some())
        }
        .await;

        Self::record("conditional_set", &timer, &result);
        result
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let timer = LatencyTimer::new();
        let result: Result<Option<String>> = async {
            let mut conn = self.connection().await?;
            let value: Option<String> = conn.get(key).await.map_err(AppError::Redis)?;
            Ok(value)
        }
        .await;

        Self::record("get", &timer, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let timer = LatencyTimer::new();
        let result: Result<()> = async {
            let mut conn = self.connection().await?;
            let _: i64 = conn.del(key).await.map_err(AppError::Redis)?;
            Ok(())
        }
        .await;

        Self::record("delete", &timer, &result);
        result
    }
}

/// Operation counters for `MemoryStorage`.
#[derive(Debug, Default)]
pub struct StorageStats {
    pub conditional_sets: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
}

impl StorageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_conditional_sets(&self) -> u64 {
        self.conditional_sets.load(Ordering::Relaxed)
    }

    pub fn get_gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn get_deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.get_conditional_sets() + self.get_gets() + self.get_deletes()
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process storage with the same semantics as `RedisStorage`.
///
/// Expiry follows tokio's clock, so tests can drive it with a paused runtime.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    stats: Arc<StorageStats>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<StorageStats> {
        Arc::clone(&self.stats)
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remaining lifetime of a live entry; `Some(None)` for entries without expiry.
    pub async fn ttl(&self, key: &str) -> Option<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let entry = entries.get(key).filter(|entry| entry.is_live(now))?;
        Some(entry.expires_at.map(|at| at - now))
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool> {
        self.stats.conditional_sets.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: effective_ttl(ttl_seconds).map(|ttl| now + Duration::from_secs(ttl)),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
