//! Build and deploy job rows

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::ReleaseError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::build::{BuildJob, BuildStatus};
use crate::models::deploy::DeployJob;
use crate::models::JobId;
use crate::storage::layout::StorageLayout;

/// Row store for jobs. Each row is written only by the controller that owns it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a build row
    async fn save_build(&self, job: &BuildJob) -> Result<(), ReleaseError>;

    /// Get a build by ID
    async fn get_build(&self, id: &JobId) -> Result<Option<BuildJob>, ReleaseError>;

    /// Delete a build row that never reached the build server
    async fn remove_build(&self, id: &JobId) -> Result<(), ReleaseError>;

    /// A successful build of the given module and commit, if any
    async fn find_success_build(
        &self,
        module: &str,
        short_id: &str,
    ) -> Result<Option<BuildJob>, ReleaseError>;

    /// Builds sharing a batch UUID
    async fn builds_in_batch(&self, batch: &Uuid) -> Result<Vec<BuildJob>, ReleaseError>;

    /// Builds still in progress
    async fn active_builds(&self) -> Result<Vec<BuildJob>, ReleaseError>;

    /// Insert or replace a deploy row
    async fn save_deploy(&self, job: &DeployJob) -> Result<(), ReleaseError>;

    /// Get a deploy by ID
    async fn get_deploy(&self, id: &JobId) -> Result<Option<DeployJob>, ReleaseError>;

    /// Deploys sharing a batch UUID
    async fn deploys_in_batch(&self, batch: &Uuid) -> Result<Vec<DeployJob>, ReleaseError>;

    /// Most recently created deploy of a module
    async fn latest_deploy(&self, module: &str) -> Result<Option<DeployJob>, ReleaseError>;
}

/// Load a build or fail with `NotFound`
pub async fn require_build(store: &dyn JobStore, id: &JobId) -> Result<BuildJob, ReleaseError> {
    store
        .get_build(id)
        .await?
        .ok_or_else(|| ReleaseError::NotFound(format!("build {}", id)))
}

/// Load a deploy or fail with `NotFound`
pub async fn require_deploy(store: &dyn JobStore, id: &JobId) -> Result<DeployJob, ReleaseError> {
    store
        .get_deploy(id)
        .await?
        .ok_or_else(|| ReleaseError::NotFound(format!("deploy {}", id)))
}

/// In-memory job store
#[derive(Default)]
pub struct InMemoryJobStore {
    builds: RwLock<HashMap<JobId, BuildJob>>,
    deploys: RwLock<HashMap<JobId, DeployJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save_build(&self, job: &BuildJob) -> Result<(), ReleaseError> {
        let mut builds = self.builds.write().unwrap_or_else(|e| e.into_inner());
        builds.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_build(&self, id: &JobId) -> Result<Option<BuildJob>, ReleaseError> {
        let builds = self.builds.read().unwrap_or_else(|e| e.into_inner());
        Ok(builds.get(id).cloned())
    }

    async fn remove_build(&self, id: &JobId) -> Result<(), ReleaseError> {
        let mut builds = self.builds.write().unwrap_or_else(|e| e.into_inner());
        builds.remove(id);
        Ok(())
    }

    async fn find_success_build(
        &self,
        module: &str,
        short_id: &str,
    ) -> Result<Option<BuildJob>, ReleaseError> {
        let builds = self.builds.read().unwrap_or_else(|e| e.into_inner());
        Ok(builds
            .values()
            .filter(|b| {
                b.module == module
                    && b.commit.short_id == short_id
                    && b.status == BuildStatus::Success
            })
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn builds_in_batch(&self, batch: &Uuid) -> Result<Vec<BuildJob>, ReleaseError> {
        let builds = self.builds.read().unwrap_or_else(|e| e.into_inner());
        let mut members: Vec<BuildJob> = builds
            .values()
            .filter(|b| b.batch_uuid.as_ref() == Some(batch))
            .cloned()
            .collect();
        members.sort_by_key(|b| b.created_at);
        Ok(members)
    }

    async fn active_builds(&self) -> Result<Vec<BuildJob>, ReleaseError> {
        let builds = self.builds.read().unwrap_or_else(|e| e.into_inner());
        Ok(builds
            .values()
            .filter(|b| b.status == BuildStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn save_deploy(&self, job: &DeployJob) -> Result<(), ReleaseError> {
        let mut deploys = self.deploys.write().unwrap_or_else(|e| e.into_inner());
        deploys.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_deploy(&self, id: &JobId) -> Result<Option<DeployJob>, ReleaseError> {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        Ok(deploys.get(id).cloned())
    }

    async fn deploys_in_batch(&self, batch: &Uuid) -> Result<Vec<DeployJob>, ReleaseError> {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        let mut members: Vec<DeployJob> = deploys
            .values()
            .filter(|d| d.batch_uuid.as_ref() == Some(batch))
            .cloned()
            .collect();
        members.sort_by_key(|d| d.created_at);
        Ok(members)
    }

    async fn latest_deploy(&self, module: &str) -> Result<Option<DeployJob>, ReleaseError> {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        Ok(deploys
            .values()
            .filter(|d| d.module == module)
            .max_by_key(|d| d.created_at)
            .cloned())
    }
}

/// One JSON file per row under the jobs directory, indexed in memory.
///
/// Rows are read from disk once at startup; queries are answered from the
/// index. A save is on disk before it returns.
pub struct FileJobStore {
    layout: StorageLayout,
    index: InMemoryJobStore,
    writing: Mutex<()>,
}

impl FileJobStore {
    /// Read every stored row. Unreadable rows are skipped.
    pub async fn load(layout: StorageLayout) -> Result<Self, ReleaseError> {
        let index = InMemoryJobStore::new();
        for build in read_rows::<BuildJob>(&layout.builds_dir()).await? {
            index.save_build(&build).await?;
        }
        for deploy in read_rows::<DeployJob>(&layout.deploys_dir()).await? {
            index.save_deploy(&deploy).await?;
        }
        Ok(Self {
            layout,
            index,
            writing: Mutex::new(()),
        })
    }
}

async fn read_rows<T: DeserializeOwned>(dir: &Dir) -> Result<Vec<T>, ReleaseError> {
    if !dir.exists().await {
        return Ok(Vec::new());
    }
    let mut rows = Vec::new();
    for path in dir.list_files_with_ext("json").await? {
        match File::new(&path).read_json::<T>().await {
            Ok(row) => rows.push(row),
            Err(e) => warn!("Skipping unreadable job row {:?}: {}", path, e),
        }
    }
    debug!("Loaded {} job row(s) from {:?}", rows.len(), dir.path());
    Ok(rows)
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save_build(&self, job: &BuildJob) -> Result<(), ReleaseError> {
        let _writing = self.writing.lock().await;
        self.layout.build_file(&job.id).write_json(job).await?;
        self.index.save_build(job).await
    }

    async fn get_build(&self, id: &JobId) -> Result<Option<BuildJob>, ReleaseError> {
        self.index.get_build(id).await
    }

    async fn remove_build(&self, id: &JobId) -> Result<(), ReleaseError> {
        let _writing = self.writing.lock().await;
        self.layout.build_file(id).delete().await?;
        self.index.remove_build(id).await
    }

    async fn find_success_build(
        &self,
        module: &str,
        short_id: &str,
    ) -> Result<Option<BuildJob>, ReleaseError> {
        self.index.find_success_build(module, short_id).await
    }

    async fn builds_in_batch(&self, batch: &Uuid) -> Result<Vec<BuildJob>, ReleaseError> {
        self.index.builds_in_batch(batch).await
    }

    async fn active_builds(&self) -> Result<Vec<BuildJob>, ReleaseError> {
        self.index.active_builds().await
    }

    async fn save_deploy(&self, job: &DeployJob) -> Result<(), ReleaseError> {
        let _writing = self.writing.lock().await;
        self.layout.deploy_file(&job.id).write_json(job).await?;
        self.index.save_deploy(job).await
    }

    async fn get_deploy(&self, id: &JobId) -> Result<Option<DeployJob>, ReleaseError> {
        self.index.get_deploy(id).await
    }

    async fn deploys_in_batch(&self, batch: &Uuid) -> Result<Vec<DeployJob>, ReleaseError> {
        self.index.deploys_in_batch(batch).await
    }

    async fn latest_deploy(&self, module: &str) -> Result<Option<DeployJob>, ReleaseError> {
        self.index.latest_deploy(module).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::{CommitDescriptor, RefKind};
    use crate::models::deploy::{DeployMode, DeployType};

    fn build(module: &str, short_id: &str) -> BuildJob {
        BuildJob::new(
            module,
            CommitDescriptor {
                kind: RefKind::Heads,
                name: "main".into(),
                short_id: short_id.into(),
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_find_success_build() {
        let store = InMemoryJobStore::new();
        let mut ok = build("web", "abc123");
        ok.status = BuildStatus::Success;
        store.save_build(&ok).await.unwrap();
        store.save_build(&build("web", "def456")).await.unwrap();

        let found = store.find_success_build("web", "abc123").await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(ok.id));
        assert!(store.find_success_build("web", "def456").await.unwrap().is_none());
        assert!(store.find_success_build("api", "abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_members() {
        let store = InMemoryJobStore::new();
        let batch = Uuid::new_v4();
        for module in ["fe-a", "fe-b"] {
            let mut job = build(module, "abc123");
            job.batch_uuid = Some(batch);
            store.save_build(&job).await.unwrap();
        }
        store.save_build(&build("other", "abc123")).await.unwrap();
        assert_eq!(store.builds_in_batch(&batch).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_require_missing() {
        let store = InMemoryJobStore::new();
        let err = require_build(&store, &Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_rows_survive_reload() {
        let dir = std::env::temp_dir().join(format!("release-jobs-{}", Uuid::new_v4()));
        let layout = StorageLayout::new(&dir);
        layout.setup().await.unwrap();

        let store = FileJobStore::load(layout.clone()).await.unwrap();
        let mut built = build("web", "abc123");
        built.status = BuildStatus::Success;
        store.save_build(&built).await.unwrap();
        let dropped = build("web", "def456");
        store.save_build(&dropped).await.unwrap();
        store.remove_build(&dropped.id).await.unwrap();
        let deploy = DeployJob::new(
            "web",
            "harbor.local/library/web:v1",
            vec!["k1".to_string()],
            DeployType::Update,
            DeployMode::Kubernetes,
        );
        store.save_deploy(&deploy).await.unwrap();
        drop(store);

        // a stray temp file and a torn row are not rows
        tokio::fs::write(dir.join("jobs/builds/leftover.1234.tmp"), b"{").await.unwrap();
        tokio::fs::write(dir.join("jobs/builds/torn.json"), b"{\"id\":").await.unwrap();

        let store = FileJobStore::load(layout).await.unwrap();
        let found = store.find_success_build("web", "abc123").await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(built.id));
        assert!(store.get_build(&dropped.id).await.unwrap().is_none());
        let latest = store.latest_deploy("web").await.unwrap().unwrap();
        assert_eq!(latest.id, deploy.id);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
