//! Kubernetes API adapter

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::adapters::http::{Auth, HttpClient};
use crate::adapters::registry::{HarborClient, ImageRegistry};
use crate::errors::ReleaseError;
use crate::storage::settings::{ClusterSettings, RegistrySettings};

/// Resource kinds the rollout touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Namespace,
    Secret,
    Service,
    Deployment,
    ReplicaSet,
    Pod,
}

impl Resource {
    /// Collection path of the resource in a namespace
    pub fn collection_path(&self, namespace: &str) -> String {
        match self {
            Resource::Namespace => "/api/v1/namespaces".to_string(),
            Resource::Secret => format!("/api/v1/namespaces/{}/secrets", namespace),
            Resource::Service => format!("/api/v1/namespaces/{}/services", namespace),
            Resource::Pod => format!("/api/v1/namespaces/{}/pods", namespace),
            Resource::Deployment => format!("/apis/apps/v1/namespaces/{}/deployments", namespace),
            Resource::ReplicaSet => format!("/apis/apps/v1/namespaces/{}/replicasets", namespace),
        }
    }

    pub fn item_path(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }
}

/// Subset of the cluster API used by the rollout pipeline
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object, `None` if it does not exist
    async fn get(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ReleaseError>;

    async fn create(
        &self,
        resource: Resource,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<(), ReleaseError>;

    async fn replace(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ReleaseError>;

    /// Merge patch an existing object
    async fn patch(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ReleaseError>;

    async fn list(
        &self,
        resource: Resource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>, ReleaseError>;
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// REST client for one API server
pub struct KubeClient {
    http: HttpClient,
}

impl KubeClient {
    pub fn new(settings: &ClusterSettings) -> Result<Self, ReleaseError> {
        let auth = Auth::bearer(settings.token.as_str());
        let http = if settings.insecure_skip_tls_verify {
            HttpClient::insecure(&settings.api_url, auth)?
        } else {
            HttpClient::new(&settings.api_url, auth)?
        };
        Ok(Self { http })
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ReleaseError> {
        self.http.get_json_opt(&resource.item_path(namespace, name)).await
    }

    async fn create(
        &self,
        resource: Resource,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<(), ReleaseError> {
        self.http
            .post_json(&resource.collection_path(namespace), body)
            .await?;
        Ok(())
    }

    async fn replace(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ReleaseError> {
        self.http
            .put_json(&resource.item_path(namespace, name), body)
            .await?;
        Ok(())
    }

    async fn patch(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<(), ReleaseError> {
        self.http
            .merge_patch(&resource.item_path(namespace, name), body)
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        resource: Resource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>, ReleaseError> {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("labelSelector", label_selector)
            .finish();
        let list: ObjectList = self
            .http
            .get_json(&format!("{}?{}", resource.collection_path(namespace), query))
            .await?;
        Ok(list.items)
    }
}

/// An opened cluster: API plus the registry its nodes pull from
#[derive(Clone)]
pub struct ClusterHandle {
    pub id: String,
    pub api: Arc<dyn ClusterApi>,
    pub registry: Arc<dyn ImageRegistry>,
    /// Project images are synced into on this cluster's registry
    pub registry_project: Option<String>,
}

/// Turns a target id into a usable cluster handle
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Fails with `ConfigInvalid` when the target cannot be addressed
    async fn connect(&self, cluster_id: &str) -> Result<ClusterHandle, ReleaseError>;
}

/// Connector backed by the settings file
pub struct SettingsConnector {
    clusters: Vec<ClusterSettings>,
    default_registry: RegistrySettings,
}

impl SettingsConnector {
    pub fn new(clusters: Vec<ClusterSettings>, default_registry: RegistrySettings) -> Self {
        Self {
            clusters,
            default_registry,
        }
    }
}

#[async_trait]
impl ClusterConnector for SettingsConnector {
    async fn connect(&self, cluster_id: &str) -> Result<ClusterHandle, ReleaseError> {
        let settings = self
            .clusters
            .iter()
            .find(|c| c.id == cluster_id)
            .ok_or_else(|| ReleaseError::ConfigInvalid(format!("unknown cluster {}", cluster_id)))?;
        if settings.api_url.is_empty() {
            return Err(ReleaseError::ConfigInvalid(format!(
                "cluster {} has no API URL",
                cluster_id
            )));
        }
        debug!("Connecting to cluster {} at {}", cluster_id, settings.api_url);

        let registry = settings.registry.as_ref().unwrap_or(&self.default_registry);
        let api = KubeClient::new(settings)
            .map_err(|e| ReleaseError::ConfigInvalid(format!("cluster {}: {}", cluster_id, e)))?;
        let registry = HarborClient::new(&registry.base_url, &registry.user, &registry.password)?;

        Ok(ClusterHandle {
            id: cluster_id.to_string(),
            api: Arc::new(api),
            registry: Arc::new(registry),
            registry_project: settings.registry_project.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_paths() {
        assert_eq!(
            Resource::Deployment.item_path("shop", "web"),
            "/apis/apps/v1/namespaces/shop/deployments/web"
        );
        assert_eq!(Resource::Namespace.item_path("", "shop"), "/api/v1/namespaces/shop");
        assert_eq!(
            Resource::Pod.collection_path("shop"),
            "/api/v1/namespaces/shop/pods"
        );
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_config_invalid() {
        let connector = SettingsConnector::new(Vec::new(), RegistrySettings::default());
        match connector.connect("k9").await {
            Err(ReleaseError::ConfigInvalid(msg)) => assert!(msg.contains("k9")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn test_connect_known_cluster() {
        let connector = SettingsConnector::new(
            vec![ClusterSettings {
                id: "k1".into(),
                api_url: "https://k1.local:6443".into(),
                token: "t".into(),
                insecure_skip_tls_verify: true,
                registry: None,
                registry_project: Some("prod".into()),
            }],
            RegistrySettings {
                base_url: "https://harbor.local".into(),
                user: "admin".into(),
                password: "pw".into(),
            },
        );
        let handle = connector.connect("k1").await.unwrap();
        assert_eq!(handle.id, "k1");
        assert_eq!(handle.registry.host(), "harbor.local");
        assert_eq!(handle.registry_project.as_deref(), Some("prod"));
    }
}
