//! Rollout controller and orchestrators

pub mod descriptor;
pub mod kubernetes;
pub mod remote_host;
pub mod state;
pub mod verify;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::build::controller::DeployHandoff;
use crate::errors::ReleaseError;
use crate::fsm::DeployEvent;
use crate::models::build::BuildJob;
use crate::models::deploy::{reduce_batch, DeployJob, DeployMode, DeployStatus, DeployType};
use crate::models::result::{JobKind, JobResult};
use crate::models::JobId;
use crate::notify::{Notice, NotifyHub, TargetSummary};
use crate::storage::jobs::require_deploy;
use crate::storage::Stores;
use crate::workers::queue::TaskQueue;

use self::state::{JobState, Recorder};

/// What an orchestrator reports once every target ran
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutSummary {
    pub status: DeployStatus,
    pub message: String,
    /// New version of record, if the rollout advances it
    pub version: Option<String>,
}

/// One rollout strategy per deployment mode
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Run every target of the job, saving `state` on each stage transition
    async fn run(&self, state: &mut JobState, recorder: &Recorder) -> Result<RolloutSummary, ReleaseError>;
}

/// A deploy request
#[derive(Debug, Clone)]
pub struct DeployOrder {
    pub module: String,
    pub image: String,
    /// Clusters or hosts; a remote-host module falls back to its host list
    pub targets: Vec<String>,
    pub deploy_type: DeployType,
    pub order_id: Option<String>,
    pub partial_acceptance: bool,
    pub batch_uuid: Option<Uuid>,
    pub actor: Option<String>,
}

impl DeployOrder {
    pub fn new(module: impl Into<String>, image: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            module: module.into(),
            image: image.into(),
            targets,
            deploy_type: DeployType::Update,
            order_id: None,
            partial_acceptance: false,
            batch_uuid: None,
            actor: None,
        }
    }
}

struct Inner {
    stores: Stores,
    queue: TaskQueue,
    notify: Arc<NotifyHub>,
    kubernetes: Arc<dyn Orchestrator>,
    remote_host: Arc<dyn Orchestrator>,
    progress_ttl: Duration,
}

/// Owns the lifecycle of deploy jobs
#[derive(Clone)]
pub struct DeployController {
    inner: Arc<Inner>,
}

impl DeployController {
    pub fn new(
        stores: Stores,
        queue: TaskQueue,
        notify: Arc<NotifyHub>,
        kubernetes: Arc<dyn Orchestrator>,
        remote_host: Arc<dyn Orchestrator>,
        progress_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores,
                queue,
                notify,
                kubernetes,
                remote_host,
                progress_ttl,
            }),
        }
    }

    fn orchestrator(&self, mode: DeployMode) -> &Arc<dyn Orchestrator> {
        match mode {
            DeployMode::Kubernetes => &self.inner.kubernetes,
            DeployMode::RemoteHost { .. } => &self.inner.remote_host,
        }
    }

    pub async fn get(&self, job_id: &JobId) -> Result<DeployJob, ReleaseError> {
        require_deploy(self.inner.stores.jobs.as_ref(), job_id).await
    }

    /// Create a deploy job and schedule its first attempt
    pub async fn request_deploy(&self, order: DeployOrder) -> Result<JobId, ReleaseError> {
        let app = self.inner.stores.apps.get(&order.module).await?;
        if order.image.trim().is_empty() {
            return Err(ReleaseError::ValidationError("image is required".to_string()));
        }
        let targets = if order.targets.is_empty() {
            app.hosts.clone()
        } else {
            order.targets
        };
        if targets.is_empty() {
            return Err(ReleaseError::ValidationError(format!(
                "no rollout targets for {}",
                app.id
            )));
        }

        let mut job = DeployJob::new(&app.id, order.image, targets, order.deploy_type, app.mode);
        job.order_id = order.order_id;
        job.partial_acceptance = order.partial_acceptance;
        job.batch_uuid = order.batch_uuid;
        job.actor = order.actor;
        self.inner.stores.jobs.save_deploy(&job).await?;
        info!(
            "Deploy {} of {} to {} target(s) requested",
            job.id,
            job.module,
            job.targets.len()
        );

        self.spawn_run(job.id);
        Ok(job.id)
    }

    /// Schedule another attempt of a finished job
    pub async fn retry(&self, job_id: &JobId) -> Result<DeployJob, ReleaseError> {
        let job = self.get(job_id).await?;
        job.clone().process(DeployEvent::Started)?;
        self.spawn_run(job.id);
        Ok(job)
    }

    fn spawn_run(&self, job_id: JobId) {
        let this = self.clone();
        self.inner.queue.spawn(format!("deploy:{}", job_id), async move {
            if let Err(e) = this.run(job_id).await {
                error!("Deploy {} failed to run: {}", job_id, e);
            }
        });
    }

    /// Run one attempt of a job to its terminal status
    pub async fn run(&self, job_id: JobId) -> Result<DeployStatus, ReleaseError> {
        let stores = &self.inner.stores;
        let mut job = self.get(&job_id).await?;
        job.process(DeployEvent::Started)?;
        stores.jobs.save_deploy(&job).await?;

        let recorder = Recorder::new(stores.progress.clone(), self.inner.progress_ttl);
        // the sentinel of a previous attempt must not finish watchers of this one
        recorder.clear(&job_id).await;
        let mut state = JobState::new(job);
        recorder.save(&state).await;

        let orchestrator = self.orchestrator(state.job.mode).clone();
        let summary = match orchestrator.run(&mut state, &recorder).await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Deploy {} aborted: {}", job_id, e);
                RolloutSummary {
                    status: DeployStatus::Failed,
                    message: e.to_string(),
                    version: None,
                }
            }
        };
        self.finalize(state, &recorder, summary).await
    }

    async fn finalize(
        &self,
        mut state: JobState,
        recorder: &Recorder,
        summary: RolloutSummary,
    ) -> Result<DeployStatus, ReleaseError> {
        let stores = &self.inner.stores;
        let app = stores.apps.get(&state.job.module).await?;
        let version_from = app.version_of_record.clone();

        let status = if summary.status.is_terminal() {
            summary.status
        } else {
            DeployStatus::Unknown
        };
        state.job.process(DeployEvent::Finished {
            status,
            message: Some(summary.message.clone()),
        })?;
        stores.jobs.save_deploy(&state.job).await?;
        if let Some(version) = &summary.version {
            if let Err(e) = stores.apps.set_version_of_record(&app.id, version).await {
                error!("Failed to advance version of {} to {}: {}", app.id, version, e);
            }
        }
        info!(
            "Deploy {} of {} finished: {} ({})",
            state.job.id,
            state.job.module,
            state.job.status.name(),
            summary.message
        );

        let result = JobResult {
            job_id: state.job.id,
            kind: JobKind::Deploy,
            status: state.job.status.code(),
            status_name: state.job.status.name().to_string(),
            message: state.job.message.clone(),
            per_target_stages: state.targets.clone(),
            console: None,
            finished_at: state.job.finished_at.unwrap_or_else(Utc::now),
        };
        match stores.results.put(&result).await {
            Ok(()) => {}
            Err(ReleaseError::AlreadyPersisted(_)) => {
                // a retried attempt keeps the first stored result
                warn!("Result of deploy {} already persisted", state.job.id);
            }
            Err(e) => error!("Failed to persist result of deploy {}: {}", state.job.id, e),
        }

        recorder.save(&state).await;
        recorder.mark_done(&state).await;

        self.inner
            .notify
            .publish(Notice {
                job_id: state.job.id,
                kind: JobKind::Deploy,
                module: state.job.module.clone(),
                status: state.job.status.code(),
                status_name: state.job.status.name().to_string(),
                message: state.job.message.clone(),
                targets: state
                    .targets
                    .iter()
                    .map(|t| TargetSummary {
                        target: t.target.clone(),
                        status: format!("{:?}", t.status).to_lowercase(),
                    })
                    .collect(),
                version_from,
                version_to: summary.version,
                actor: state.job.actor.clone(),
                order_id: state.job.order_id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(state.job.status)
    }

    /// Accept or reject a partially successful rollout
    pub async fn review_acceptance(
        &self,
        job_id: &JobId,
        accept: bool,
        message: Option<String>,
    ) -> Result<DeployJob, ReleaseError> {
        let mut job = self.get(job_id).await?;
        if !job.partial_acceptance {
            return Err(ReleaseError::ValidationError(format!(
                "deploy {} does not allow partial acceptance",
                job_id
            )));
        }
        let event = if accept {
            DeployEvent::Accepted
        } else {
            DeployEvent::Rejected(message)
        };
        job.process(event)?;
        self.inner.stores.jobs.save_deploy(&job).await?;
        info!("Deploy {} reviewed: {}", job_id, job.status.name());
        Ok(job)
    }

    /// Most recent deploy of a module
    pub async fn latest(&self, module: &str) -> Result<DeployJob, ReleaseError> {
        self.inner.stores.apps.get(module).await?;
        self.inner
            .stores
            .jobs
            .latest_deploy(module)
            .await?
            .ok_or_else(|| ReleaseError::NotFound(format!("deploy of {}", module)))
    }

    /// Aggregate status of a batch
    pub async fn batch_status(&self, batch: &Uuid) -> Result<(DeployStatus, Vec<DeployJob>), ReleaseError> {
        let members = self.inner.stores.jobs.deploys_in_batch(batch).await?;
        if members.is_empty() {
            return Err(ReleaseError::NotFound(format!("deploy batch {}", batch)));
        }
        let status = reduce_batch(members.iter().map(|m| m.status));
        Ok((status, members))
    }
}

#[async_trait]
impl DeployHandoff for DeployController {
    async fn handoff(&self, build: &BuildJob, image: String) -> Result<JobId, ReleaseError> {
        let mut order = DeployOrder::new(&build.module, image, build.targets.clone());
        order.batch_uuid = build.batch_uuid;
        order.actor = build.deployer.clone();
        self.request_deploy(order).await
    }
}
