//! Multi-cluster rollout
//!
//! Clusters are processed one after another. Each runs connect, image sync (ticket
//! rollouts only), ensure, apply and verify; a failed stage stops that cluster only.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::adapters::cluster::{ClusterApi, ClusterConnector, ClusterHandle, Resource};
use crate::deploy::descriptor::{DescriptorProducer, Workload, PULL_SECRET};
use crate::deploy::state::{JobState, Recorder};
use crate::deploy::verify::{verify_rollout, VerifyFailure, VerifyOptions};
use crate::deploy::{Orchestrator, RolloutSummary};
use crate::errors::ReleaseError;
use crate::models::app::AppModule;
use crate::models::deploy::{reduce_targets, DeployStatus};
use crate::models::stage::{KubeStage, StageStatus, TargetStatus};
use crate::storage::apps::AppRegistry;
use crate::utils::image_tag;

#[derive(Debug, Clone)]
pub struct KubernetesOptions {
    /// Replace existing deployments instead of merge patching them
    pub force_replace: bool,
    pub verify: VerifyOptions,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            force_replace: true,
            verify: VerifyOptions::default(),
        }
    }
}

pub struct KubernetesOrchestrator {
    connector: Arc<dyn ClusterConnector>,
    descriptors: Arc<dyn DescriptorProducer>,
    apps: Arc<dyn AppRegistry>,
    options: KubernetesOptions,
}

impl KubernetesOrchestrator {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        descriptors: Arc<dyn DescriptorProducer>,
        apps: Arc<dyn AppRegistry>,
        options: KubernetesOptions,
    ) -> Self {
        Self {
            connector,
            descriptors,
            apps,
            options,
        }
    }

    async fn run_target(&self, app: &AppModule, idx: usize, state: &mut JobState, recorder: &Recorder) {
        let target = state.targets[idx].target.clone();

        state.begin(idx, KubeStage::Connect.as_str());
        recorder.save(state).await;
        let handle = match self.connector.connect(&target).await {
            Ok(handle) => {
                state.finish(idx, StageStatus::Success, "", Value::Null);
                handle
            }
            Err(e) => {
                warn!("Cannot connect to cluster {}: {}", target, e);
                state.finish(idx, StageStatus::Failed, e.to_string(), json!({ "kind": e.kind() }));
                recorder.save(state).await;
                return;
            }
        };
        recorder.save(state).await;

        let mut image = state.job.image.clone();
        if state.job.order_id.is_some() {
            state.begin(idx, KubeStage::ImageSync.as_str());
            recorder.save(state).await;
            match self.sync_image(app, &handle, &image).await {
                Ok((synced, log)) => {
                    state.finish(idx, StageStatus::Success, "", log);
                    image = synced;
                }
                Err(e) => {
                    warn!("Image sync to {} failed: {}", target, e);
                    state.finish(idx, StageStatus::Failed, e.to_string(), Value::Null);
                    recorder.save(state).await;
                    return;
                }
            }
            recorder.save(state).await;
        }

        state.begin(idx, KubeStage::Ensure.as_str());
        recorder.save(state).await;
        let workload = self.descriptors.workload(app, &image, &target).await;
        let ensured = self.ensure(app, &handle, workload.as_ref().ok()).await;
        state.finish(idx, StageStatus::Success, "", ensured);
        recorder.save(state).await;

        state.begin(idx, KubeStage::Apply.as_str());
        recorder.save(state).await;
        let applied = match workload {
            Ok(workload) => self.apply(app, handle.api.as_ref(), &workload).await,
            Err(e) => Err(ReleaseError::ApplyFailed(e.to_string())),
        };
        let name = match applied {
            Ok((name, log)) => {
                state.finish(idx, StageStatus::Success, "", log);
                name
            }
            Err(e) => {
                warn!("Apply of {} on {} failed: {}", app.id, target, e);
                state.finish(idx, StageStatus::Failed, e.to_string(), Value::Null);
                recorder.save(state).await;
                return;
            }
        };
        recorder.save(state).await;

        state.begin(idx, KubeStage::Verify.as_str());
        recorder.save(state).await;
        let expected = image_tag(&image).to_string();
        match verify_rollout(handle.api.as_ref(), app.namespace(), &name, &expected, &self.options.verify).await {
            Ok(summary) => state.finish(idx, StageStatus::Success, "", summary),
            Err(failure) => {
                let status = match failure {
                    VerifyFailure::Timeout { .. } => StageStatus::TimedOut,
                    _ => StageStatus::Failed,
                };
                warn!("Verification of {} on {}: {}", app.id, target, failure.message());
                state.finish(idx, status, failure.message(), failure.diagnostic());
            }
        }
        recorder.save(state).await;

        if state.targets[idx].status == TargetStatus::Success {
            if let Err(e) = self.apps.set_target_version(&app.id, &target, &expected).await {
                warn!("Failed to record version of {} on {}: {}", app.id, target, e);
            }
        }
    }

    /// Make the image available on the cluster's registry; returns the image to deploy
    async fn sync_image(
        &self,
        app: &AppModule,
        handle: &ClusterHandle,
        image: &str,
    ) -> Result<(String, Value), ReleaseError> {
        let tag = image_tag(image);
        let project = handle
            .registry_project
            .clone()
            .unwrap_or_else(|| app.registry_project.clone());
        let synced = format!("{}/{}/{}:{}", handle.registry.host(), project, app.id, tag);

        if handle.registry.tag_exists(&project, &app.id, tag).await? {
            return Ok((synced, json!({ "image": image, "copied": false })));
        }
        handle
            .registry
            .copy_tag(&app.registry_project, &project, &app.id, tag)
            .await?;
        Ok((synced, json!({ "image": image, "copied": true })))
    }

    /// Create namespace, pull secret and service when missing. Never fails.
    async fn ensure(&self, app: &AppModule, handle: &ClusterHandle, workload: Option<&Workload>) -> Value {
        let api = handle.api.as_ref();
        let namespace = app.namespace();
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "kubernetes.io/dockerconfigjson",
            "metadata": { "name": PULL_SECRET, "namespace": namespace },
            "data": {
                ".dockerconfigjson": STANDARD.encode(handle.registry.docker_config().to_string()),
            },
        });
        let namespace_body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": namespace },
        });

        let mut log = serde_json::Map::new();
        let mut objects = vec![
            (Resource::Namespace, "", namespace.to_string(), namespace_body),
            (Resource::Secret, namespace, PULL_SECRET.to_string(), secret),
        ];
        if let Some(service) = workload.and_then(|w| w.service.clone()) {
            let name = service["metadata"]["name"].as_str().unwrap_or(&app.id).to_string();
            objects.push((Resource::Service, namespace, name, service));
        }

        for (resource, ns, name, body) in objects {
            let outcome = match ensure_object(api, resource, ns, &name, &body).await {
                Ok(true) => "created".to_string(),
                Ok(false) => "present".to_string(),
                Err(e) => {
                    warn!("Failed to ensure {:?} {} on {}: {}", resource, name, handle.id, e);
                    format!("error: {}", e)
                }
            };
            log.insert(format!("{:?}/{}", resource, name).to_lowercase(), json!(outcome));
        }
        Value::Object(log)
    }

    async fn apply(
        &self,
        app: &AppModule,
        api: &dyn ClusterApi,
        workload: &Workload,
    ) -> Result<(String, Value), ReleaseError> {
        let name = workload.name()?.to_string();
        let namespace = app.namespace();
        let apply_failed = |e: ReleaseError| ReleaseError::ApplyFailed(e.to_string());

        let existing = api
            .get(Resource::Deployment, namespace, &name)
            .await
            .map_err(apply_failed)?;
        let action = match existing {
            None => {
                api.create(Resource::Deployment, namespace, &workload.deployment)
                    .await
                    .map_err(apply_failed)?;
                "created"
            }
            Some(current) if self.options.force_replace => {
                let mut body = workload.deployment.clone();
                body["metadata"]["resourceVersion"] = current["metadata"]["resourceVersion"].clone();
                api.replace(Resource::Deployment, namespace, &name, &body)
                    .await
                    .map_err(apply_failed)?;
                "replaced"
            }
            Some(_) => {
                api.patch(Resource::Deployment, namespace, &name, &workload.deployment)
                    .await
                    .map_err(apply_failed)?;
                "patched"
            }
        };
        info!("Deployment {}/{} {}", namespace, name, action);
        Ok((name, json!({ "action": action })))
    }
}

/// Create an object unless it exists; true when created
async fn ensure_object(
    api: &dyn ClusterApi,
    resource: Resource,
    namespace: &str,
    name: &str,
    body: &Value,
) -> Result<bool, ReleaseError> {
    if api.get(resource, namespace, name).await?.is_some() {
        return Ok(false);
    }
    api.create(resource, namespace, body).await?;
    Ok(true)
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn run(&self, state: &mut JobState, recorder: &Recorder) -> Result<RolloutSummary, ReleaseError> {
        let app = self.apps.get(&state.job.module).await?;
        for idx in 0..state.targets.len() {
            self.run_target(&app, idx, state, recorder).await;
        }

        let status = reduce_targets(&state.targets);
        let failed: Vec<String> = state
            .targets
            .iter()
            .filter(|t| t.status != TargetStatus::Success)
            .map(|t| {
                let reason = t
                    .stages
                    .last()
                    .map(|s| format!("{} {}", s.name, s.message))
                    .unwrap_or_default();
                format!("{}: {}", t.target, reason.trim())
            })
            .collect();
        let message = if failed.is_empty() {
            format!("{} cluster(s) rolled out", state.targets.len())
        } else {
            failed.join("; ")
        };

        Ok(RolloutSummary {
            status,
            message,
            version: (status == DeployStatus::Success).then(|| image_tag(&state.job.image).to_string()),
        })
    }
}
