use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::info;

use super::{BackendKind, CacheBackend, CacheEntry, CacheError, CacheKey};

const SCAN_COUNT: usize = 500;
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);

/// Redis-backed store shared between replicas.
///
/// Keys live under `prefix`. Expiry is delegated to Redis via `SET .. EX`; `clear`
/// walks the prefix with SCAN and deletes each page as it goes so other data in the
/// same database is never touched. Every round trip, including each SCAN page, is
/// bounded by `op_timeout`.
///
/// The connection is opened on first use. A failed attempt is not retried until
/// [`RECONNECT_COOLDOWN`] has passed; calls in between fail immediately, so an
/// outage costs the request path at most one timeout.
pub struct SharedBackend {
    client: redis::Client,
    prefix: String,
    op_timeout: Duration,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    connection: Option<ConnectionManager>,
    last_failure: Option<Instant>,
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("prefix", &self.prefix)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl SharedBackend {
    pub fn new(url: &str, prefix: String, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|error| CacheError::Configuration(error.to_string()))?;
        Ok(Self { client, prefix, op_timeout, slot: Mutex::new(Slot::default()) })
    }

    fn namespaced(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.as_str())
    }

    fn scan_pattern(&self) -> String {
        format!("{}*", self.prefix)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.op_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // The manager's own backoff would outlive `op_timeout`; one attempt per call.
    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(self.op_timeout)
            .set_response_timeout(self.op_timeout)
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        {
            let slot = self.lock_slot();
            if let Some(connection) = slot.connection.as_ref() {
                return Ok(connection.clone());
            }
            if slot.last_failure.is_some_and(|failed_at| failed_at.elapsed() < RECONNECT_COOLDOWN) {
                return Err(CacheError::Connection(
                    "reconnect suppressed after a recent failed attempt".to_string(),
                ));
            }
        }

        let connect = self.client.get_connection_manager_with_config(self.manager_config());
        let attempt = timeout(self.op_timeout, connect).await;

        let mut slot = self.lock_slot();
        let result = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => {
                slot.last_failure = Some(Instant::now());
                return Err(CacheError::Connection(error.to_string()));
            }
            Err(_) => {
                slot.last_failure = Some(Instant::now());
                let timeout_ms = self.timeout_ms();
                return Err(CacheError::Timeout { operation: "connect", timeout_ms });
            }
        };

        if let Some(existing) = slot.connection.as_ref() {
            return Ok(existing.clone());
        }
        slot.connection = Some(result.clone());
        slot.last_failure = None;
        info!(
            event_name = "cache.shared.connected",
            key_prefix = %self.prefix,
            "shared cache connection established"
        );
        Ok(result)
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.op_timeout, call)
            .await
            .map_err(|_| CacheError::Timeout { operation, timeout_ms: self.timeout_ms() })?
            .map_err(|error| CacheError::Operation { operation, message: error.to_string() })
    }

    /// One SCAN page under the prefix. Returns the next cursor, `0` once the walk is done.
    async fn scan_page(
        &self,
        operation: &'static str,
        connection: &mut ConnectionManager,
        cursor: u64,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut command = redis::cmd("SCAN");
        command
            .cursor_arg(cursor)
            .arg("MATCH")
            .arg(self.scan_pattern())
            .arg("COUNT")
            .arg(SCAN_COUNT);
        self.bounded(operation, command.query_async::<(u64, Vec<String>)>(connection)).await
    }
}

#[async_trait]
impl CacheBackend for SharedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut connection = self.connection().await?;
        let raw: Option<String> =
            self.bounded("get", connection.get(self.namespaced(key))).await?;

        raw.map(|raw| {
            serde_json::from_str::<CacheEntry>(&raw)
                .map_err(|error| CacheError::Serialization(error.to_string()))
        })
        .transpose()
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(&entry)
            .map_err(|error| CacheError::Serialization(error.to_string()))?;
        let ttl_secs = entry.ttl.as_secs().max(1);
        let mut connection = self.connection().await?;

        let key = self.namespaced(&entry.key);
        self.bounded("put", connection.set_ex::<_, _, ()>(key, encoded, ttl_secs)).await
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        let mut connection = self.connection().await?;
        let mut cursor = 0u64;
        let mut cleared = 0u64;

        loop {
            let (next, keys) = self.scan_page("clear", &mut connection, cursor).await?;
            if !keys.is_empty() {
                let removed: u64 = self.bounded("clear", connection.del(keys)).await?;
                cleared += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(cleared)
    }

    async fn len(&self) -> Result<u64, CacheError> {
        let mut connection = self.connection().await?;
        let mut cursor = 0u64;
        let mut count = 0u64;

        loop {
            let (next, keys) = self.scan_page("len", &mut connection, cursor).await?;
            count += keys.len() as u64;
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(count)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut connection = self.connection().await?;
        let probe = format!("{}__probe__", self.prefix);
        self.bounded("ping", connection.exists::<_, bool>(probe)).await.map(|_| ())
    }
}
