//! Workload descriptors and host parameter sets
//!
//! The descriptor content is opaque to the rollout: only the image, names and
//! target metadata are filled in here.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::ReleaseError;
use crate::filesys::file::File;
use crate::models::app::AppModule;
use crate::utils::image_tag;

/// Name of the registry pull secret created in every namespace
pub const PULL_SECRET: &str = "registry-credentials";

/// Objects applied to one cluster
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Workload {
    pub deployment: Value,
    #[serde(default)]
    pub service: Option<Value>,
}

impl Workload {
    pub fn name(&self) -> Result<&str, ReleaseError> {
        self.deployment["metadata"]["name"]
            .as_str()
            .ok_or_else(|| ReleaseError::Descriptor("deployment has no metadata.name".to_string()))
    }
}

/// Supplies deployment payloads
#[async_trait]
pub trait DescriptorProducer: Send + Sync {
    /// Cluster workload for `image` on `target`
    async fn workload(&self, app: &AppModule, image: &str, target: &str)
        -> Result<Workload, ReleaseError>;

    /// Extra variables for a remote-host playbook run
    async fn host_vars(&self, app: &AppModule, image: &str, hosts: &[String])
        -> Result<Value, ReleaseError>;
}

/// Reads `{module}.json` (and `{module}.vars.json`) templates from a directory,
/// falling back to a built-in single-container workload.
pub struct TemplateDescriptorProducer {
    dir: Option<PathBuf>,
}

impl TemplateDescriptorProducer {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    async fn template(&self, file_name: String) -> Result<Option<Value>, ReleaseError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let file = File::new(dir.join(file_name));
        if !file.exists().await {
            return Ok(None);
        }
        debug!("Loading descriptor template {}", file.path().display());
        let value = file
            .read_json::<Value>()
            .await
            .map_err(|e| ReleaseError::Descriptor(format!("{}: {}", file.path().display(), e)))?;
        Ok(Some(value))
    }
}

/// Built-in deployment and service of a module
pub fn default_workload(app: &AppModule, image: &str) -> Workload {
    let labels = json!({ "app": app.id });
    Workload {
        deployment: json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": app.id,
                "namespace": app.namespace(),
                "labels": labels,
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": labels },
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "imagePullSecrets": [{ "name": PULL_SECRET }],
                        "containers": [{
                            "name": app.id,
                            "image": image,
                            "ports": [{ "containerPort": app.service_port }],
                        }],
                    },
                },
            },
        }),
        service: Some(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": app.id,
                "namespace": app.namespace(),
                "labels": labels,
            },
            "spec": {
                "selector": labels,
                "ports": [{ "port": app.service_port, "targetPort": app.service_port }],
            },
        })),
    }
}

/// Point a workload at `image` and the module's namespace
pub fn bind_workload(mut workload: Workload, app: &AppModule, image: &str) -> Result<Workload, ReleaseError> {
    let containers = workload.deployment["spec"]["template"]["spec"]["containers"]
        .as_array_mut()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ReleaseError::Descriptor(format!("{} has no containers", app.id)))?;
    containers[0]["image"] = json!(image);

    workload.deployment["metadata"]["namespace"] = json!(app.namespace());
    if let Some(service) = workload.service.as_mut() {
        service["metadata"]["namespace"] = json!(app.namespace());
    }
    workload.name()?;
    Ok(workload)
}

#[async_trait]
impl DescriptorProducer for TemplateDescriptorProducer {
    async fn workload(
        &self,
        app: &AppModule,
        image: &str,
        target: &str,
    ) -> Result<Workload, ReleaseError> {
        let workload = match self.template(format!("{}.json", app.id)).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| ReleaseError::Descriptor(format!("{}: {}", app.id, e)))?,
            None => default_workload(app, image),
        };
        debug!("Workload of {} for {} resolved", app.id, target);
        bind_workload(workload, app, image)
    }

    async fn host_vars(
        &self,
        app: &AppModule,
        image: &str,
        hosts: &[String],
    ) -> Result<Value, ReleaseError> {
        let mut vars = json!({
            "module": app.id,
            "image": image,
            "tag": image_tag(image),
            "hosts": hosts,
        });
        if let Some(Value::Object(extra)) = self.template(format!("{}.vars.json", app.id)).await? {
            if let Value::Object(map) = &mut vars {
                for (key, value) in extra {
                    map.entry(key).or_insert(value);
                }
            }
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deploy::DeployMode;

    #[tokio::test]
    async fn test_default_workload_carries_image() {
        let producer = TemplateDescriptorProducer::new(None);
        let app = AppModule::new("web", DeployMode::Kubernetes);
        let workload = producer
            .workload(&app, "harbor/library/web:v2", "k1")
            .await
            .unwrap();
        assert_eq!(workload.name().unwrap(), "web");
        assert_eq!(
            workload.deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            "harbor/library/web:v2"
        );
        assert!(workload.service.is_some());
    }

    #[tokio::test]
    async fn test_template_from_dir() {
        let dir = std::env::temp_dir().join(format!("descriptors-{}", uuid::Uuid::new_v4()));
        let app = AppModule::new("api", DeployMode::Kubernetes);
        let mut template = default_workload(&app, "placeholder");
        template.deployment["spec"]["replicas"] = json!(3);
        File::new(dir.join("api.json"))
            .write_json(&json!({ "deployment": template.deployment }))
            .await
            .unwrap();
        File::new(dir.join("api.vars.json"))
            .write_json(&json!({ "jvm_opts": "-Xmx1g", "image": "ignored" }))
            .await
            .unwrap();

        let producer = TemplateDescriptorProducer::new(Some(dir.clone()));
        let workload = producer.workload(&app, "reg/p/api:v9", "k1").await.unwrap();
        assert_eq!(workload.deployment["spec"]["replicas"], 3);
        assert_eq!(
            workload.deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            "reg/p/api:v9"
        );
        assert!(workload.service.is_none());

        let vars = producer
            .host_vars(&app, "reg/p/api:v9", &["h1".to_string()])
            .await
            .unwrap();
        assert_eq!(vars["jvm_opts"], "-Xmx1g");
        assert_eq!(vars["image"], "reg/p/api:v9");
        assert_eq!(vars["tag"], "v9");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_bind_rejects_empty_containers() {
        let app = AppModule::new("api", DeployMode::Kubernetes);
        let workload = Workload {
            deployment: json!({"metadata": {"name": "api"}, "spec": {"template": {"spec": {"containers": []}}}}),
            service: None,
        };
        assert!(matches!(
            bind_workload(workload, &app, "x:1"),
            Err(ReleaseError::Descriptor(_))
        ));
    }
}
