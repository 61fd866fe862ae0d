//! Per-attempt rollout state and its progress recorder

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use crate::cache::progress::{done_key, snapshot_key, ProgressStore};
use crate::models::deploy::DeployJob;
use crate::models::result::JobKind;
use crate::models::JobId;
use crate::models::stage::{reduce_target, StageResult, StageStatus, TargetResult, TargetStatus};

/// State of one rollout attempt, threaded through every stage function
#[derive(Debug, Clone)]
pub struct JobState {
    pub job: DeployJob,
    pub targets: Vec<TargetResult>,
    last_tick: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new(job: DeployJob) -> Self {
        let targets = job.targets.iter().map(TargetResult::new).collect();
        Self {
            job,
            targets,
            last_tick: None,
        }
    }

    /// Current time, strictly after every earlier tick
    pub fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    /// Append a pending stage to a target
    pub fn begin(&mut self, target: usize, stage: &str) {
        let at = self.tick();
        let result = &mut self.targets[target];
        result.stages.push(StageResult::pending(stage, at));
        result.status = TargetStatus::InProgress;
    }

    /// Close the last stage of a target and recompute the target status
    pub fn finish(
        &mut self,
        target: usize,
        status: StageStatus,
        message: impl Into<String>,
        log: serde_json::Value,
    ) {
        let at = self.tick();
        let result = &mut self.targets[target];
        if let Some(stage) = result.stages.last_mut() {
            stage.status = status;
            stage.message = message.into();
            stage.log = log;
            stage.finished_at = Some(at);
        }
        result.status = reduce_target(&result.stages);
    }

    /// Record a stage that ran to completion outside the pipeline
    pub fn record(&mut self, target: usize, stage: &str, status: StageStatus, message: impl Into<String>) {
        self.begin(target, stage);
        self.finish(target, status, message, serde_json::Value::Null);
    }

    /// Replace the structured log of the running stage of a target
    pub fn set_log(&mut self, target: usize, log: serde_json::Value) {
        if let Some(stage) = self.targets[target].stages.last_mut() {
            stage.log = log;
        }
    }

    pub fn index_of(&self, target: &str) -> Option<usize> {
        self.targets.iter().position(|t| t.target == target)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "jobId": self.job.id,
            "module": self.job.module,
            "status": self.job.status.code(),
            "statusName": self.job.status.name(),
            "targets": self.targets,
        })
    }
}

/// Writes rollout snapshots to the progress store
#[derive(Clone)]
pub struct Recorder {
    progress: Arc<dyn ProgressStore>,
    ttl: Duration,
}

impl Recorder {
    pub fn new(progress: Arc<dyn ProgressStore>, ttl: Duration) -> Self {
        Self { progress, ttl }
    }

    /// Drop what an earlier attempt of the job left behind
    pub async fn clear(&self, job_id: &JobId) {
        for key in [snapshot_key(JobKind::Deploy, job_id), done_key(JobKind::Deploy, job_id)] {
            if let Err(e) = self.progress.delete(&key).await {
                warn!("Failed to delete progress entry {}: {}", key, e);
            }
        }
    }

    /// Publish the full per-target snapshot
    pub async fn save(&self, state: &JobState) {
        let key = snapshot_key(JobKind::Deploy, &state.job.id);
        if let Err(e) = self.progress.set(&key, state.snapshot(), self.ttl).await {
            warn!("Failed to write progress of deploy {}: {}", state.job.id, e);
        }
    }

    /// Publish the terminal sentinel
    pub async fn mark_done(&self, state: &JobState) {
        let key = done_key(JobKind::Deploy, &state.job.id);
        if let Err(e) = self
            .progress
            .set(&key, json!(state.job.status.code()), self.ttl)
            .await
        {
            warn!("Failed to mark deploy {} done: {}", state.job.id, e);
        }
    }
}
