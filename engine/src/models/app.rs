//! Application module model

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deploy::DeployMode;
use crate::models::JobId;

/// A deployable image produced by a successful build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub image: String,
    pub tag: String,
    pub build_job: JobId,
    pub created_at: DateTime<Utc>,
}

/// A buildable, deployable unit of an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppModule {
    pub id: String,
    pub mode: DeployMode,
    /// Kubernetes namespace, defaults to the module id
    #[serde(default)]
    pub namespace: Option<String>,
    /// Registry project images are pushed to
    #[serde(default = "default_registry_project")]
    pub registry_project: String,
    /// Container port exposed by the service object
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// All hosts of a remote-host module
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Last-known-good image tag
    #[serde(default)]
    pub version_of_record: Option<String>,
    /// Current image tag per cluster or host
    #[serde(default)]
    pub target_versions: HashMap<String, String>,
    /// Candidate artifacts, newest first
    #[serde(default)]
    pub artifacts: VecDeque<Artifact>,
}

fn default_registry_project() -> String {
    "library".to_string()
}

fn default_service_port() -> u16 {
    8080
}

impl AppModule {
    pub fn new(id: impl Into<String>, mode: DeployMode) -> Self {
        Self {
            id: id.into(),
            mode,
            namespace: None,
            registry_project: default_registry_project(),
            service_port: default_service_port(),
            hosts: Vec::new(),
            version_of_record: None,
            target_versions: HashMap::new(),
            artifacts: VecDeque::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.id)
    }

    /// Name of the CI job definition for this module
    pub fn build_job_name(&self) -> String {
        format!("{}-build", self.id)
    }

    /// Push an artifact to the front, evicting the oldest beyond `retention`
    pub fn push_artifact(&mut self, artifact: Artifact, retention: usize) {
        self.artifacts.retain(|a| a.tag != artifact.tag);
        self.artifacts.push_front(artifact);
        while self.artifacts.len() > retention {
            self.artifacts.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(tag: &str) -> Artifact {
        Artifact {
            image: format!("harbor/library/web:{}", tag),
            tag: tag.to_string(),
            build_job: uuid::Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_artifact_retention() {
        let mut app = AppModule::new("web", DeployMode::Kubernetes);
        for tag in ["v1", "v2", "v3", "v4"] {
            app.push_artifact(artifact(tag), 3);
        }
        let tags: Vec<&str> = app.artifacts.iter().map(|a| a.tag.as_str()).collect();
        assert_eq!(tags, vec!["v4", "v3", "v2"]);
    }

    #[test]
    fn test_rebuilt_tag_moves_to_front() {
        let mut app = AppModule::new("web", DeployMode::Kubernetes);
        app.push_artifact(artifact("v1"), 3);
        app.push_artifact(artifact("v2"), 3);
        app.push_artifact(artifact("v1"), 3);
        assert_eq!(app.artifacts.len(), 2);
        assert_eq!(app.artifacts[0].tag, "v1");
    }
}
