//! Answer cache.
//!
//! ```text
//! CacheStore (facade, fail-soft)
//!   └── dyn CacheBackend
//!         ├── MemoryBackend   <- process-local RwLock<HashMap>
//!         └── SharedBackend   <- Redis ConnectionManager, prefixed keys
//! ```
//!
//! Backends report every failure as a [`CacheError`]. The store never propagates
//! them: reads degrade to a miss, writes and clears become no-ops, and the store
//! flags itself as degraded until a backend call succeeds again.

pub mod key;
pub mod memory;
pub mod shared;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, ConfigError};

pub use key::{credential_fingerprint, normalize_prompt, CacheKey};
pub use memory::MemoryBackend;
pub use shared::SharedBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Shared,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Shared => "shared",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "shared" | "redis" => Ok(Self::Shared),
            other => Err(ConfigError::Validation(format!(
                "unsupported cache backend `{other}` (expected memory|shared)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: impl Into<String>, ttl: Duration) -> Self {
        Self { key, payload: payload.into(), created_at: Utc::now(), ttl }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return false;
        };
        match self.created_at.checked_add_signed(ttl) {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend connection failed: {0}")]
    Connection(String),
    #[error("cache backend operation `{operation}` failed: {message}")]
    Operation { operation: &'static str, message: String },
    #[error("cache backend operation `{operation}` timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },
    #[error("cache entry could not be decoded: {0}")]
    Serialization(String),
    #[error("cache backend misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Returns `None` for keys never written or already expired.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Removes every entry owned by this backend and returns how many were removed.
    async fn clear(&self) -> Result<u64, CacheError>;

    async fn len(&self) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError> {
        self.len().await.map(|_| ())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entry_count: u64,
    pub backend_kind: BackendKind,
    pub ttl_seconds: u64,
    pub degraded: bool,
}

pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    ttl: Duration,
    degraded: AtomicBool,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend_kind", &self.backend.kind())
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, enabled: bool, ttl: Duration) -> Self {
        Self { backend, enabled, ttl, degraded: AtomicBool::new(false) }
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Shared => {
                let url = config.shared_url.as_deref().ok_or_else(|| {
                    CacheError::Configuration("shared backend requires a url".to_string())
                })?;
                Arc::new(SharedBackend::new(
                    url,
                    config.key_prefix.clone(),
                    config.operation_timeout(),
                )?)
            }
        };

        info!(
            event_name = "cache.store.configured",
            correlation_id = "bootstrap",
            backend_kind = backend.kind().as_str(),
            enabled = config.enabled,
            ttl_secs = config.ttl_secs,
            "answer cache configured"
        );

        Ok(Self::new(backend, config.enabled, config.ttl()))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }

        match self.backend.get(key).await {
            Ok(entry) => {
                self.mark_healthy();
                entry.filter(|entry| !entry.is_expired())
            }
            Err(error) => {
                self.mark_unavailable("get", &error);
                None
            }
        }
    }

    pub async fn put(&self, key: &CacheKey, payload: &str, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let entry = CacheEntry::new(key.clone(), payload, ttl);
        match self.backend.put(entry).await {
            Ok(()) => {
                self.mark_healthy();
                debug!(event_name = "cache.put", cache_key = %key, "answer cached");
            }
            Err(error) => self.mark_unavailable("put", &error),
        }
    }

    pub async fn clear(&self) -> u64 {
        match self.backend.clear().await {
            Ok(cleared) => {
                self.mark_healthy();
                info!(event_name = "cache.clear", cleared, "answer cache cleared");
                cleared
            }
            Err(error) => {
                self.mark_unavailable("clear", &error);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entry_count = if self.enabled {
            match self.backend.len().await {
                Ok(count) => {
                    self.mark_healthy();
                    count
                }
                Err(error) => {
                    self.mark_unavailable("len", &error);
                    0
                }
            }
        } else {
            0
        };

        CacheStats {
            enabled: self.enabled,
            entry_count,
            backend_kind: self.backend.kind(),
            ttl_seconds: self.ttl.as_secs(),
            degraded: self.is_degraded(),
        }
    }

    /// Probes the backend directly and surfaces the error, for health and doctor checks.
    pub async fn check(&self) -> Result<(), CacheError> {
        match self.backend.ping().await {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            }
            Err(error) => {
                self.mark_unavailable("ping", &error);
                Err(error)
            }
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(
                event_name = "cache.backend.recovered",
                backend_kind = self.backend.kind().as_str(),
                "cache backend available again"
            );
        }
    }

    fn mark_unavailable(&self, operation: &'static str, error: &CacheError) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(
            event_name = "cache.backend.unavailable",
            backend_kind = self.backend.kind().as_str(),
            operation,
            error = %error,
            "cache backend unavailable; continuing without cache"
        );
    }
}
