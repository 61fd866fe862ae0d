//! Build pipeline controller

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::build_server::{BuildServer, StageFlow};
use crate::build::completion::{resolved, Completions, Resolution};
use crate::build::definition::{self, DefinitionChange, JobDefinition};
use crate::build::flow::{self, FlowTimeouts};
use crate::cache::progress::{done_key, snapshot_key};
use crate::errors::ReleaseError;
use crate::fsm::BuildEvent;
use crate::models::app::{AppModule, Artifact};
use crate::models::build::{reduce_batch, BuildJob, BuildStatus, CommitDescriptor};
use crate::models::result::{JobKind, JobResult};
use crate::models::JobId;
use crate::notify::{Notice, NotifyHub};
use crate::poll::PollPolicy;
use crate::storage::jobs::require_build;
use crate::storage::settings::Settings;
use crate::storage::Stores;
use crate::workers::queue::TaskQueue;

/// Build controller options
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub queue_bind: PollPolicy,
    pub flow: FlowTimeouts,
    pub progress_ttl: Duration,
    /// Delay before the progress entries of a timed out build are purged
    pub timeout_cleanup: Duration,
    pub artifact_retention: usize,
    pub callback_url: Option<String>,
    /// Registry host prefixed to artifact images
    pub registry_host: String,
    pub pipeline_repo: String,
    pub credentials_id: String,
    pub script_path: String,
}

impl BuildOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let timing = &settings.timing;
        let registry_host = settings
            .registry
            .base_url
            .split("://")
            .last()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        Self {
            queue_bind: PollPolicy::fixed(
                timing.queue_bind_attempts,
                Duration::from_millis(timing.queue_bind_interval_ms),
            ),
            flow: FlowTimeouts {
                interval: Duration::from_millis(timing.flow_poll_interval_ms),
                queueing: Duration::from_secs(timing.queue_timeout_secs),
                execution: Duration::from_secs(timing.execution_timeout_secs),
            },
            progress_ttl: timing.progress_ttl(),
            timeout_cleanup: Duration::from_secs(timing.timeout_cleanup_secs),
            artifact_retention: settings.artifact_retention,
            callback_url: settings.build_server.callback_url.clone(),
            registry_host,
            pipeline_repo: settings.build_server.pipeline_repo.clone(),
            credentials_id: settings.build_server.credentials_id.clone(),
            script_path: settings.build_server.script_path.clone(),
        }
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A build request as the controller sees it
#[derive(Debug, Clone)]
pub struct BuildOrder {
    pub module: String,
    pub commit: CommitDescriptor,
    pub image_tag: Option<String>,
    pub batch_uuid: Option<Uuid>,
    pub deployer: Option<String>,
    pub deploy_after: bool,
    pub force_rebuild: bool,
    /// Rollout targets for the handoff, the module's defaults when empty
    pub targets: Vec<String>,
}

impl BuildOrder {
    pub fn new(module: impl Into<String>, commit: CommitDescriptor) -> Self {
        Self {
            module: module.into(),
            commit,
            image_tag: None,
            batch_uuid: None,
            deployer: None,
            deploy_after: false,
            force_rebuild: false,
            targets: Vec::new(),
        }
    }
}

/// Receives successful builds flagged for deployment
#[async_trait]
pub trait DeployHandoff: Send + Sync {
    async fn handoff(&self, build: &BuildJob, image: String) -> Result<JobId, ReleaseError>;
}

/// Owns the lifecycle of build jobs
pub struct BuildController {
    server: Arc<dyn BuildServer>,
    stores: Stores,
    queue: TaskQueue,
    notify: Arc<NotifyHub>,
    handoff: Option<Arc<dyn DeployHandoff>>,
    completions: Completions,
    options: BuildOptions,
}

impl BuildController {
    pub fn new(
        server: Arc<dyn BuildServer>,
        stores: Stores,
        queue: TaskQueue,
        notify: Arc<NotifyHub>,
        options: BuildOptions,
    ) -> Self {
        Self {
            server,
            stores,
            queue,
            notify,
            handoff: None,
            completions: Completions::new(),
            options,
        }
    }

    pub fn with_handoff(mut self, handoff: Arc<dyn DeployHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn definition(&self, app: &AppModule) -> JobDefinition {
        JobDefinition {
            description: format!("{} build pipeline", app.id),
            repo_url: self.options.pipeline_repo.clone(),
            credentials_id: self.options.credentials_id.clone(),
            script_path: self.options.script_path.clone(),
        }
    }

    /// Create or reconfigure the module's CI job
    pub async fn ensure_job_definition(
        &self,
        app: &AppModule,
    ) -> Result<DefinitionChange, ReleaseError> {
        definition::ensure_job_definition(
            self.server.as_ref(),
            &app.build_job_name(),
            &self.definition(app),
        )
        .await
    }

    pub async fn get(&self, job_id: &JobId) -> Result<BuildJob, ReleaseError> {
        require_build(self.stores.jobs.as_ref(), job_id).await
    }

    /// Validate, submit and start following a new build
    pub async fn request_build(self: &Arc<Self>, order: BuildOrder) -> Result<JobId, ReleaseError> {
        let app = self.stores.apps.get(&order.module).await?;

        if !order.force_rebuild {
            if let Some(prior) = self
                .stores
                .jobs
                .find_success_build(&app.id, &order.commit.short_id)
                .await?
            {
                info!(
                    "Commit {} of {} already built by {}",
                    order.commit.short_id, app.id, prior.id
                );
                return Err(ReleaseError::DuplicateCommit {
                    module: app.id.clone(),
                    commit: order.commit.short_id,
                });
            }
        }

        let mut job = BuildJob::new(&app.id, order.commit, order.image_tag);
        job.batch_uuid = order.batch_uuid;
        job.deployer = order.deployer;
        job.deploy_after = order.deploy_after;
        job.targets = order.targets;
        self.stores.jobs.save_build(&job).await?;

        if let Err(e) = self.submit(&app, &mut job).await {
            warn!("Build {} of {} was not submitted: {}", job.id, app.id, e);
            if let Err(remove_err) = self.stores.jobs.remove_build(&job.id).await {
                error!("Failed to remove unsubmitted build {}: {}", job.id, remove_err);
            }
            return Err(e);
        }

        self.spawn_follow(job.id);
        Ok(job.id)
    }

    /// Follow again the builds a previous run left in progress
    pub async fn resume(self: &Arc<Self>) -> Result<usize, ReleaseError> {
        let active = self.stores.jobs.active_builds().await?;
        for job in &active {
            debug!("Resuming build {} of {}", job.id, job.module);
            self.spawn_follow(job.id);
        }
        Ok(active.len())
    }

    /// Reset a finished build and submit it again
    pub async fn retry(self: &Arc<Self>, job_id: &JobId) -> Result<BuildJob, ReleaseError> {
        let mut job = self.reset(job_id).await?;
        let app = self.stores.apps.get(&job.module).await?;
        self.submit(&app, &mut job).await?;
        self.spawn_follow(job.id);
        Ok(job)
    }

    fn build_params(&self, job: &BuildJob) -> Vec<(String, String)> {
        let mut params = vec![
            ("MODULE".to_string(), job.module.clone()),
            ("BRANCH".to_string(), job.commit.build_ref()),
            ("IMAGE_TAG".to_string(), job.image_tag.clone()),
            ("JOB_ID".to_string(), job.id.to_string()),
        ];
        if let Some(url) = &self.options.callback_url {
            params.push(("CALLBACK_URL".to_string(), url.clone()));
        }
        params
    }

    async fn submit(&self, app: &AppModule, job: &mut BuildJob) -> Result<(), ReleaseError> {
        let name = app.build_job_name();

        // a job the server does not know yet has nothing queued
        let busy = match self.server.is_busy(&name).await {
            Ok(busy) => busy,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        if busy {
            return Err(ReleaseError::QueueBusy(format!(
                "{} has a queued or running build",
                name
            )));
        }

        self.ensure_job_definition(app).await?;

        let queue = self.server.build_job(&name, &self.build_params(job)).await?;
        job.process(BuildEvent::Submitted { queue })?;
        self.stores.jobs.save_build(job).await?;
        self.publish(job, None).await;
        info!("Build {} of {} queued as item {}", job.id, app.id, queue);
        Ok(())
    }

    fn spawn_follow(self: &Arc<Self>, job_id: JobId) {
        let this = self.clone();
        self.queue
            .spawn(format!("build:{}", job_id), async move { this.follow(job_id).await });
    }

    /// Bind the build number and poll the flow, unless another path resolves first
    pub async fn follow(&self, job_id: JobId) {
        let mut latch = self.completions.subscribe(job_id);
        let outcome = tokio::select! {
            outcome = self.drive(job_id) => outcome,
            _ = resolved(&mut latch) => {
                debug!("Build {} resolved elsewhere, polling stops", job_id);
                return;
            }
        };

        match outcome {
            Ok(resolution) => {
                if self.completions.resolve(job_id, resolution.clone()) {
                    self.finish(job_id, resolution).await;
                }
            }
            Err(e) => error!("Failed to follow build {}: {}", job_id, e),
        }
    }

    async fn drive(&self, job_id: JobId) -> Result<Resolution, ReleaseError> {
        let number = match self.bind_build_number(&job_id).await {
            Ok(number) => number,
            Err(ReleaseError::QueueBindTimeout { queue, attempts }) => {
                warn!(
                    "Queue item {} of build {} unbound after {} attempts",
                    queue, job_id, attempts
                );
                return Ok(Resolution::TimedOut("queue bind timeout".to_string()));
            }
            Err(ReleaseError::BuildServer(message)) => {
                return Ok(Resolution::Finished {
                    status: BuildStatus::Aborted,
                    message: Some(message),
                });
            }
            Err(e) => return Err(e),
        };

        let job = self.get(&job_id).await?;
        let app = self.stores.apps.get(&job.module).await?;
        let name = app.build_job_name();
        let job = &job;
        let resolution = flow::await_flow(
            self.server.as_ref(),
            &name,
            number,
            &self.options.flow,
            |flow| async move { self.publish(job, Some(&flow)).await },
        )
        .await;
        Ok(resolution)
    }

    /// Bind the external build number of a queued job. A bound job is left as is.
    pub async fn bind_build_number(&self, job_id: &JobId) -> Result<u64, ReleaseError> {
        let job = self.get(job_id).await?;
        if let Some(number) = job.build_number {
            debug!("Build {} already bound to #{}", job_id, number);
            return Ok(number);
        }
        let queue = job.queue_number.ok_or_else(|| {
            ReleaseError::InvalidTransition(format!("build {} was never queued", job_id))
        })?;

        let number = flow::bind_number(self.server.as_ref(), queue, &self.options.queue_bind).await?;

        let mut job = self.get(job_id).await?;
        if job.bind_number(number) {
            self.stores.jobs.save_build(&job).await?;
            info!("Build {} bound to #{}", job_id, number);
        }
        Ok(job.build_number.unwrap_or(number))
    }

    /// Push notice from the build pipeline
    pub async fn on_callback(&self, job_id: &JobId, module: &str) -> Result<(), ReleaseError> {
        let job = self.get(job_id).await?;
        if job.module != module {
            return Err(ReleaseError::ValidationError(format!(
                "build {} belongs to {}, not {}",
                job_id, job.module, module
            )));
        }
        if job.status.is_terminal() {
            debug!("Callback for finished build {} ignored", job_id);
            return Ok(());
        }

        let number = self.bind_build_number(job_id).await?;
        let app = self.stores.apps.get(module).await?;
        let flow = self.server.stage_flow(&app.build_job_name(), number).await?;
        match flow::terminal_status(&flow.status) {
            Some(status) => {
                let resolution = flow::finished(status, &flow);
                if self.completions.resolve(*job_id, resolution.clone()) {
                    self.finish(*job_id, resolution).await;
                }
            }
            None => debug!(
                "Callback for build {} arrived before the flow ended, polling continues",
                job_id
            ),
        }
        Ok(())
    }

    /// Stop a build and every running sibling of its batch
    pub async fn stop(&self, job_id: &JobId) -> Result<Vec<JobId>, ReleaseError> {
        let job = self.get(job_id).await?;
        let members = match job.batch_uuid {
            Some(batch) => self.stores.jobs.builds_in_batch(&batch).await?,
            None => vec![job],
        };

        let mut stopped = Vec::new();
        for member in members.into_iter().filter(|m| m.status == BuildStatus::InProgress) {
            if let Some(number) = member.build_number {
                let name = self.stores.apps.get(&member.module).await?.build_job_name();
                match self.server.stop(&name, number).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("{}#{} already gone", name, number),
                    Err(e) => warn!("Failed to stop {}#{}: {}", name, number, e),
                }
            }
            if self.completions.resolve(member.id, Resolution::Stopped) {
                self.finish(member.id, Resolution::Stopped).await;
                stopped.push(member.id);
            }
        }
        Ok(stopped)
    }

    /// Un-terminate a finished build so it can be submitted again
    pub async fn reset(&self, job_id: &JobId) -> Result<BuildJob, ReleaseError> {
        let mut job = self.get(job_id).await?;
        job.process(BuildEvent::Reset)?;
        self.stores.jobs.save_build(&job).await?;
        for key in [snapshot_key(JobKind::Build, job_id), done_key(JobKind::Build, job_id)] {
            if let Err(e) = self.stores.progress.delete(&key).await {
                warn!("Failed to delete progress entry {}: {}", key, e);
            }
        }
        self.completions.forget(job_id);
        info!("Build {} reset", job_id);
        Ok(job)
    }

    /// Builds still waiting on the build server, oldest first
    pub async fn active(&self) -> Result<Vec<BuildJob>, ReleaseError> {
        let mut builds = self.stores.jobs.active_builds().await?;
        builds.sort_by_key(|b| b.created_at);
        Ok(builds)
    }

    /// Aggregate status of a batch
    pub async fn batch_status(&self, batch: &Uuid) -> Result<(BuildStatus, Vec<BuildJob>), ReleaseError> {
        let members = self.stores.jobs.builds_in_batch(batch).await?;
        if members.is_empty() {
            return Err(ReleaseError::NotFound(format!("build batch {}", batch)));
        }
        let status = reduce_batch(members.iter().map(|m| m.status));
        Ok((status, members))
    }

    async fn finish(&self, job_id: JobId, resolution: Resolution) {
        if let Err(e) = self.finalize(job_id, resolution).await {
            error!("Failed to finalize build {}: {}", job_id, e);
        }
        self.completions.forget(&job_id);
    }

    async fn finalize(&self, job_id: JobId, resolution: Resolution) -> Result<(), ReleaseError> {
        let mut job = self.get(&job_id).await?;
        if job.status.is_terminal() {
            debug!("Build {} already finished as {}", job_id, job.status.name());
            return Ok(());
        }
        let app = self.stores.apps.get(&job.module).await?;
        let name = app.build_job_name();

        let event = match resolution {
            Resolution::Finished { status, message } => BuildEvent::Finished { status, message },
            Resolution::TimedOut(message) => BuildEvent::TimedOut(message),
            Resolution::Stopped => BuildEvent::Stopped,
        };
        job.process(event)?;
        self.stores.jobs.save_build(&job).await?;
        info!(
            "Build {} of {} finished: {} ({})",
            job.id,
            job.module,
            job.status.name(),
            job.message.as_deref().unwrap_or_default()
        );

        let (flow, console) = match job.build_number {
            Some(number) => {
                let flow = self
                    .server
                    .stage_flow(&name, number)
                    .await
                    .map_err(|e| warn!("Failed to fetch stage flow of {}#{}: {}", name, number, e))
                    .ok();
                let console = self
                    .server
                    .console_text(&name, number)
                    .await
                    .map_err(|e| warn!("Failed to fetch console of {}#{}: {}", name, number, e))
                    .ok();
                (flow, console)
            }
            None => (None, None),
        };

        if let Err(e) = self.persist_result(&app, &job, flow.as_ref(), console).await {
            error!("Failed to persist result of build {}: {}", job.id, e);
        }
        self.publish(&job, flow.as_ref()).await;
        self.mark_done(&job).await;
        self.notify.publish(self.notice(&app, &job)).await;

        if job.status == BuildStatus::TimedOut {
            self.schedule_cleanup(&job);
        }
        if job.status == BuildStatus::Success && job.deploy_after {
            if let Some(handoff) = &self.handoff {
                match handoff.handoff(&job, self.image_for(&app, &job.image_tag)).await {
                    Ok(deploy_id) => info!("Build {} handed off to deploy {}", job.id, deploy_id),
                    Err(e) => error!("Handoff of build {} failed: {}", job.id, e),
                }
            }
        }
        Ok(())
    }

    /// Full image reference of a build's artifact
    pub fn image_for(&self, app: &AppModule, tag: &str) -> String {
        if self.options.registry_host.is_empty() {
            format!("{}/{}:{}", app.registry_project, app.id, tag)
        } else {
            format!(
                "{}/{}/{}:{}",
                self.options.registry_host, app.registry_project, app.id, tag
            )
        }
    }

    /// Write the durable result once; register the artifact on success
    pub async fn persist_result(
        &self,
        app: &AppModule,
        job: &BuildJob,
        flow: Option<&StageFlow>,
        console: Option<String>,
    ) -> Result<(), ReleaseError> {
        let target = match job.build_number {
            Some(number) => format!("{}#{}", app.build_job_name(), number),
            None => app.build_job_name(),
        };
        let result = JobResult {
            job_id: job.id,
            kind: JobKind::Build,
            status: job.status.code(),
            status_name: job.status.name().to_string(),
            message: job.message.clone(),
            per_target_stages: vec![flow::flow_target(target, job.status, flow, job.created_at)],
            console,
            finished_at: job.finished_at.unwrap_or_else(Utc::now),
        };

        match self.stores.results.put(&result).await {
            Ok(()) => {}
            Err(ReleaseError::AlreadyPersisted(id)) => {
                warn!("Result of build {} already persisted", id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if job.status == BuildStatus::Success {
            let artifact = Artifact {
                image: self.image_for(app, &job.image_tag),
                tag: job.image_tag.clone(),
                build_job: job.id,
                created_at: Utc::now(),
            };
            self.stores
                .apps
                .push_artifact(&app.id, artifact, self.options.artifact_retention)
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, job: &BuildJob, flow: Option<&StageFlow>) {
        let snapshot = json!({
            "jobId": job.id,
            "module": job.module,
            "status": job.status.code(),
            "statusName": job.status.name(),
            "buildNumber": job.build_number,
            "message": job.message,
            "flow": flow,
        });
        let key = snapshot_key(JobKind::Build, &job.id);
        if let Err(e) = self
            .stores
            .progress
            .set(&key, snapshot, self.options.progress_ttl)
            .await
        {
            warn!("Failed to write progress of build {}: {}", job.id, e);
        }
    }

    async fn mark_done(&self, job: &BuildJob) {
        let key = done_key(JobKind::Build, &job.id);
        if let Err(e) = self
            .stores
            .progress
            .set(&key, json!(job.status.code()), self.options.progress_ttl)
            .await
        {
            warn!("Failed to mark build {} done: {}", job.id, e);
        }
    }

    fn schedule_cleanup(&self, job: &BuildJob) {
        let stores = self.stores.clone();
        let job_id = job.id;
        let finished_at = job.finished_at;
        self.queue.schedule(
            format!("cleanup:{}", job_id),
            self.options.timeout_cleanup,
            async move {
                // a reset or retried build owns the progress keys now
                match stores.jobs.get_build(&job_id).await {
                    Ok(Some(current))
                        if current.status == BuildStatus::TimedOut
                            && current.finished_at == finished_at => {}
                    Ok(_) => {
                        debug!("Build {} moved on, its progress stays", job_id);
                        return;
                    }
                    Err(e) => {
                        warn!("Failed to load build {} before cleanup: {}", job_id, e);
                        return;
                    }
                }
                for key in [snapshot_key(JobKind::Build, &job_id), done_key(JobKind::Build, &job_id)] {
                    if let Err(e) = stores.progress.delete(&key).await {
                        warn!("Failed to purge progress entry {}: {}", key, e);
                    }
                }
                debug!("Purged progress of timed out build {}", job_id);
            },
        );
    }

    fn notice(&self, app: &AppModule, job: &BuildJob) -> Notice {
        Notice {
            job_id: job.id,
            kind: JobKind::Build,
            module: job.module.clone(),
            status: job.status.code(),
            status_name: job.status.name().to_string(),
            message: job.message.clone(),
            targets: Vec::new(),
            version_from: app.version_of_record.clone(),
            version_to: (job.status == BuildStatus::Success).then(|| job.image_tag.clone()),
            actor: job.deployer.clone(),
            order_id: None,
            timestamp: Utc::now(),
        }
    }
}
