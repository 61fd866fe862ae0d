//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ReleaseError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::JobId;

/// On-disk layout of the engine's data directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Default settings file location
    pub fn default_settings_file() -> File {
        File::new("/etc/release-engine/settings.json")
    }

    /// Durable job results
    pub fn results_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("results"))
    }

    /// Result file of one job
    pub fn result_file(&self, job_id: &JobId) -> File {
        File::new(self.base_dir.join("results").join(format!("{}.json", job_id)))
    }

    /// Build job rows
    pub fn builds_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("jobs").join("builds"))
    }

    /// Row file of one build
    pub fn build_file(&self, job_id: &JobId) -> File {
        File::new(self.builds_dir().path().join(format!("{}.json", job_id)))
    }

    /// Deploy job rows
    pub fn deploys_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("jobs").join("deploys"))
    }

    /// Row file of one deploy
    pub fn deploy_file(&self, job_id: &JobId) -> File {
        File::new(self.deploys_dir().path().join(format!("{}.json", job_id)))
    }

    /// Application versions and artifacts
    pub fn apps_file(&self) -> File {
        File::new(self.base_dir.join("apps.json"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ReleaseError> {
        self.results_dir().create().await?;
        self.builds_dir().create().await?;
        self.deploys_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/release-engine")
    }
}
