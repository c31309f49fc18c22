use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{BackendKind, CacheBackend, CacheEntry, CacheError, CacheKey};

/// Process-local backend. Expired entries are dropped lazily on read and swept on write.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        Ok(entries.get(key).filter(|entry| !entry.is_expired_at(now)).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        entries.retain(|_, existing| !existing.is_expired_at(now));
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().await;
        let cleared = entries.len() as u64;
        entries.clear();
        Ok(cleared)
    }

    async fn len(&self) -> Result<u64, CacheError> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        Ok(entries.values().filter(|entry| !entry.is_expired_at(now)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::MemoryBackend;
    use crate::cache::{CacheBackend, CacheEntry, CacheKey};

    fn entry(prompt: &str, payload: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(CacheKey::derive(prompt, "https://crm.example.com", "k"), payload, ttl)
    }

    #[tokio::test]
    async fn last_writer_wins() -> Result<(), crate::cache::CacheError> {
        let backend = MemoryBackend::new();
        backend.put(entry("q", "first", Duration::from_secs(60))).await?;
        backend.put(entry("q", "second", Duration::from_secs(60))).await?;

        let key = CacheKey::derive("q", "https://crm.example.com", "k");
        assert_eq!(backend.get(&key).await?.map(|entry| entry.payload), Some("second".to_string()));
        assert_eq!(backend.len().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn write_sweeps_expired_entries() -> Result<(), crate::cache::CacheError> {
        let backend = MemoryBackend::new();
        backend.put(entry("stale", "x", Duration::from_millis(10))).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.put(entry("fresh", "y", Duration::from_secs(60))).await?;

        assert_eq!(backend.clear().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_writers_and_clear_do_not_deadlock() -> Result<(), crate::cache::CacheError> {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();
        for index in 0..16 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                backend
                    .put(entry(&format!("q{index}"), "v", Duration::from_secs(60)))
                    .await
            }));
        }
        let clearer = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.clear().await })
        };

        for handle in handles {
            assert!(matches!(handle.await, Ok(Ok(()))));
        }
        assert!(matches!(clearer.await, Ok(Ok(_))));
        assert!(backend.len().await? <= 16);
        Ok(())
    }
}
