//! TTL-bounded progress store
//!
//! Orchestrators write the latest stage snapshot of a job under
//! [`snapshot_key`] and a sentinel under [`done_key`] once the pipeline finishes.
//! Watchers only read.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::errors::ReleaseError;
use crate::models::result::JobKind;
use crate::models::JobId;

/// Key of the latest snapshot of a job
pub fn snapshot_key(kind: JobKind, id: &JobId) -> String {
    format!("app{}:{}", kind.as_str(), id)
}

/// Key of the "pipeline finished" sentinel of a job
pub fn done_key(kind: JobKind, id: &JobId) -> String {
    format!("app{}:stat:{}", kind.as_str(), id)
}

/// Key/value store whose entries expire
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<(), ReleaseError>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, ReleaseError>;

    async fn delete(&self, key: &str) -> Result<(), ReleaseError>;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, ReleaseError>;
}

#[derive(Debug, Clone)]
struct ProgressEntry {
    value: serde_json::Value,
    written_at: Instant,
    expires_at: Instant,
}

/// In-memory progress store
pub struct InMemoryProgressStore {
    entries: RwLock<HashMap<String, ProgressEntry>>,
    capacity: usize,
}

impl InMemoryProgressStore {
    /// Create a new progress store
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of live and expired entries
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<(), ReleaseError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        // Evict oldest if at capacity
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.written_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            ProgressEntry {
                value,
                written_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, ReleaseError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), ReleaseError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, ReleaseError> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            snapshot_key(JobKind::Deploy, &id),
            format!("appdeploy:{}", id)
        );
        assert_eq!(done_key(JobKind::Deploy, &id), format!("appdeploy:stat:{}", id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = InMemoryProgressStore::new(10);
        store.set("a", json!({"s": 1}), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"s": 1})));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let store = InMemoryProgressStore::new(2);
        let ttl = Duration::from_secs(60);
        store.set("a", json!(1), ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set("b", json!(2), ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set("c", json!(3), ttl).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let store = InMemoryProgressStore::new(1);
        let ttl = Duration::from_secs(60);
        store.set("a", json!(1), ttl).await.unwrap();
        store.set("a", json!(2), ttl).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(2)));
    }
}
