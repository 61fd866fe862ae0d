//! Durable, write-once job results

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::ReleaseError;
use crate::models::result::JobResult;
use crate::models::JobId;
use crate::storage::layout::StorageLayout;

/// Result store. A result is written once per job and never mutated.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a result; `AlreadyPersisted` if one exists for the job
    async fn put(&self, result: &JobResult) -> Result<(), ReleaseError>;

    /// Get the result of a job
    async fn get(&self, job_id: &JobId) -> Result<Option<JobResult>, ReleaseError>;
}

/// In-memory result store
#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<JobId, JobResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, result: &JobResult) -> Result<(), ReleaseError> {
        let mut results = self.results.write().unwrap_or_else(|e| e.into_inner());
        if results.contains_key(&result.job_id) {
            return Err(ReleaseError::AlreadyPersisted(result.job_id.to_string()));
        }
        results.insert(result.job_id, result.clone());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobResult>, ReleaseError> {
        let results = self.results.read().unwrap_or_else(|e| e.into_inner());
        Ok(results.get(job_id).cloned())
    }
}

/// One JSON file per job under the results directory
pub struct FileResultStore {
    layout: StorageLayout,
}

impl FileResultStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn put(&self, result: &JobResult) -> Result<(), ReleaseError> {
        let file = self.layout.result_file(&result.job_id);
        debug!("Persisting result of {} to {:?}", result.job_id, file.path());
        match file.create_json(result).await {
            Ok(()) => Ok(()),
            Err(ReleaseError::IoError(e)) if e.kind() == ErrorKind::AlreadyExists => {
                Err(ReleaseError::AlreadyPersisted(result.job_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobResult>, ReleaseError> {
        let file = self.layout.result_file(job_id);
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_json().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::result::JobKind;
    use crate::models::stage::TargetResult;

    fn result(job_id: JobId) -> JobResult {
        JobResult {
            job_id,
            kind: JobKind::Deploy,
            status: 1,
            status_name: "success".into(),
            message: None,
            per_target_stages: vec![TargetResult::new("k1")],
            console: None,
            finished_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_write_once() {
        let store = InMemoryResultStore::new();
        let id = uuid::Uuid::new_v4();
        store.put(&result(id)).await.unwrap();

        let mut changed = result(id);
        changed.status = 2;
        let err = store.put(&changed).await.unwrap_err();
        assert!(matches!(err, ReleaseError::AlreadyPersisted(_)));
        assert_eq!(store.get(&id).await.unwrap().map(|r| r.status), Some(1));
    }

    #[tokio::test]
    async fn test_file_write_once() {
        let dir = std::env::temp_dir().join(format!("release-results-{}", uuid::Uuid::new_v4()));
        let store = FileResultStore::new(StorageLayout::new(&dir));
        let id = uuid::Uuid::new_v4();

        assert!(store.get(&id).await.unwrap().is_none());
        store.put(&result(id)).await.unwrap();
        assert!(matches!(
            store.put(&result(id)).await,
            Err(ReleaseError::AlreadyPersisted(_))
        ));
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.job_id, id);
        assert_eq!(stored.per_target_stages[0].target, "k1");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
