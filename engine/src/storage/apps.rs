//! Application registry: versions of record, artifacts and host completion sets

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::errors::ReleaseError;
use crate::filesys::file::File;
use crate::models::app::{AppModule, Artifact};

/// Registry of application modules and their rollout bookkeeping
#[async_trait]
pub trait AppRegistry: Send + Sync {
    /// Get a module or fail with `NotFound`
    async fn get(&self, module: &str) -> Result<AppModule, ReleaseError>;

    /// Advance the module's version of record
    async fn set_version_of_record(&self, module: &str, tag: &str) -> Result<(), ReleaseError>;

    /// Record the image tag currently running on one target
    async fn set_target_version(
        &self,
        module: &str,
        target: &str,
        tag: &str,
    ) -> Result<(), ReleaseError>;

    /// Register a candidate artifact, keeping at most `retention`
    async fn push_artifact(
        &self,
        module: &str,
        artifact: Artifact,
        retention: usize,
    ) -> Result<(), ReleaseError>;

    /// Hosts already deployed under a ledger key
    async fn done_hosts(&self, key: &str) -> Result<HashSet<String>, ReleaseError>;

    /// Add hosts to a ledger key and return the updated set
    async fn add_done_hosts(
        &self,
        key: &str,
        hosts: &[String],
    ) -> Result<HashSet<String>, ReleaseError>;

    /// Forget every host recorded under a ledger key
    async fn clear_done_hosts(&self, key: &str) -> Result<(), ReleaseError>;
}

/// Persisted shape of the registry's mutable state
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    apps: Vec<AppModule>,
    ledger: HashMap<String, HashSet<String>>,
}

/// In-memory registry, optionally mirrored to a JSON file.
///
/// Memory is authoritative while the process runs. A failed flush is logged and
/// the next successful one catches the file up.
pub struct InMemoryAppRegistry {
    apps: RwLock<HashMap<String, AppModule>>,
    ledger: RwLock<HashMap<String, HashSet<String>>>,
    file: Option<File>,
    // one flush at a time, each writing the state current when it got the lock
    flushing: Mutex<()>,
}

impl InMemoryAppRegistry {
    pub fn new(apps: Vec<AppModule>) -> Self {
        Self {
            apps: RwLock::new(apps.into_iter().map(|a| (a.id.clone(), a)).collect()),
            ledger: RwLock::new(HashMap::new()),
            file: None,
            flushing: Mutex::new(()),
        }
    }

    /// Load configured modules and overlay the bookkeeping saved in `file`
    pub async fn load(apps: Vec<AppModule>, file: File) -> Result<Self, ReleaseError> {
        let registry = Self {
            file: Some(file.clone()),
            ..Self::new(apps)
        };
        if !file.exists().await {
            return Ok(registry);
        }

        let snapshot: RegistrySnapshot = file.read_json().await?;
        info!(
            "Restoring {} modules and {} ledgers from {:?}",
            snapshot.apps.len(),
            snapshot.ledger.len(),
            file.path()
        );
        {
            let mut apps = registry.apps.write().unwrap_or_else(|e| e.into_inner());
            for saved in snapshot.apps {
                // configuration wins; only the bookkeeping is restored
                if let Some(app) = apps.get_mut(&saved.id) {
                    app.version_of_record = saved.version_of_record;
                    app.target_versions = saved.target_versions;
                    app.artifacts = saved.artifacts;
                }
            }
        }
        *registry.ledger.write().unwrap_or_else(|e| e.into_inner()) = snapshot.ledger;
        Ok(registry)
    }

    fn update<F>(&self, module: &str, f: F) -> Result<(), ReleaseError>
    where
        F: FnOnce(&mut AppModule),
    {
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        let app = apps
            .get_mut(module)
            .ok_or_else(|| ReleaseError::NotFound(format!("module {}", module)))?;
        f(app);
        Ok(())
    }

    async fn flush(&self) {
        let Some(file) = &self.file else {
            return;
        };
        let _flushing = self.flushing.lock().await;
        let snapshot = {
            let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
            let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
            RegistrySnapshot {
                apps: apps.values().cloned().collect(),
                ledger: ledger.clone(),
            }
        };
        debug!("Flushing app registry to {:?}", file.path());
        if let Err(e) = file.write_json(&snapshot).await {
            error!("Failed to flush app registry to {:?}: {}", file.path(), e);
        }
    }
}

#[async_trait]
impl AppRegistry for InMemoryAppRegistry {
    async fn get(&self, module: &str) -> Result<AppModule, ReleaseError> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.get(module)
            .cloned()
            .ok_or_else(|| ReleaseError::NotFound(format!("module {}", module)))
    }

    async fn set_version_of_record(&self, module: &str, tag: &str) -> Result<(), ReleaseError> {
        self.update(module, |app| app.version_of_record = Some(tag.to_string()))?;
        self.flush().await;
        Ok(())
    }

    async fn set_target_version(
        &self,
        module: &str,
        target: &str,
        tag: &str,
    ) -> Result<(), ReleaseError> {
        self.update(module, |app| {
            app.target_versions
                .insert(target.to_string(), tag.to_string());
        })?;
        self.flush().await;
        Ok(())
    }

    async fn push_artifact(
        &self,
        module: &str,
        artifact: Artifact,
        retention: usize,
    ) -> Result<(), ReleaseError> {
        self.update(module, |app| app.push_artifact(artifact, retention))?;
        self.flush().await;
        Ok(())
    }

    async fn done_hosts(&self, key: &str) -> Result<HashSet<String>, ReleaseError> {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        Ok(ledger.get(key).cloned().unwrap_or_default())
    }

    async fn add_done_hosts(
        &self,
        key: &str,
        hosts: &[String],
    ) -> Result<HashSet<String>, ReleaseError> {
        let updated = {
            let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
            let done = ledger.entry(key.to_string()).or_default();
            done.extend(hosts.iter().cloned());
            done.clone()
        };
        self.flush().await;
        Ok(updated)
    }

    async fn clear_done_hosts(&self, key: &str) -> Result<(), ReleaseError> {
        {
            let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
            ledger.remove(key);
        }
        self.flush().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deploy::DeployMode;

    #[tokio::test]
    async fn test_ledger_accumulates_and_clears() {
        let registry = InMemoryAppRegistry::new(vec![AppModule::new("api", DeployMode::Kubernetes)]);
        registry.add_done_hosts("k", &["h1".into()]).await.unwrap();
        let done = registry.add_done_hosts("k", &["h2".into()]).await.unwrap();
        assert_eq!(done.len(), 2);

        registry.clear_done_hosts("k").await.unwrap();
        assert!(registry.done_hosts("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_module() {
        let registry = InMemoryAppRegistry::new(Vec::new());
        let err = registry.set_version_of_record("nope", "v1").await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bookkeeping_survives_reload() {
        let path = std::env::temp_dir().join(format!("release-apps-{}.json", uuid::Uuid::new_v4()));
        let apps = vec![AppModule::new("web", DeployMode::Kubernetes)];

        let registry = InMemoryAppRegistry::load(apps.clone(), File::new(&path)).await.unwrap();
        registry.set_version_of_record("web", "v42").await.unwrap();
        registry.add_done_hosts("batchdeploy::web::T1", &["h1".into()]).await.unwrap();

        let reloaded = InMemoryAppRegistry::load(apps, File::new(&path)).await.unwrap();
        assert_eq!(
            reloaded.get("web").await.unwrap().version_of_record.as_deref(),
            Some("v42")
        );
        assert_eq!(reloaded.done_hosts("batchdeploy::web::T1").await.unwrap().len(), 1);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
