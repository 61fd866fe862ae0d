//! Remote-host rollout
//!
//! Each attempt runs one playbook against the hosts not yet recorded as done under
//! the job's ledger key. The first failing task stops the run.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::remote::{ExecEvent, PlaybookRun, RemoteExecutor, TaskEvent, TaskOutcome};
use crate::deploy::descriptor::DescriptorProducer;
use crate::deploy::state::{JobState, Recorder};
use crate::deploy::{Orchestrator, RolloutSummary};
use crate::errors::ReleaseError;
use crate::models::deploy::{DeployMode, DeployStatus, DeployType, HostFlavor};
use crate::models::stage::{StageStatus, TargetStatus};
use crate::storage::apps::AppRegistry;
use crate::utils::image_tag;

const DEPLOY_STAGE: &str = "deploy";
const ROLLBACK_STAGE: &str = "rollback";

pub fn deploy_playbook(flavor: HostFlavor) -> String {
    format!("{}-deploy.yml", flavor.as_str())
}

pub fn rollback_playbook(flavor: HostFlavor) -> String {
    format!("{}-rollback.yml", flavor.as_str())
}

/// How one playbook run ended
#[derive(Debug, Default)]
struct RunOutcome {
    /// Hosts that finished every task
    done: Vec<String>,
    /// First failing task, if any
    failure: Option<String>,
}

pub struct RemoteHostOrchestrator {
    executor: Arc<dyn RemoteExecutor>,
    descriptors: Arc<dyn DescriptorProducer>,
    apps: Arc<dyn AppRegistry>,
}

impl RemoteHostOrchestrator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        descriptors: Arc<dyn DescriptorProducer>,
        apps: Arc<dyn AppRegistry>,
    ) -> Self {
        Self {
            executor,
            descriptors,
            apps,
        }
    }

    /// Run a playbook against `hosts`, recording one stage per host
    async fn execute(
        &self,
        state: &mut JobState,
        recorder: &Recorder,
        stage: &str,
        run: PlaybookRun,
    ) -> RunOutcome {
        let hosts = run.hosts.clone();
        let mut task_logs: Vec<Vec<Value>> = vec![Vec::new(); state.targets.len()];
        for host in &hosts {
            if let Some(idx) = state.index_of(host) {
                state.begin(idx, stage);
            }
        }
        recorder.save(state).await;

        let (tx, mut rx) = mpsc::channel(64);
        let exec = self.executor.run(run, tx);
        tokio::pin!(exec);
        let mut exec_result = None;
        let mut outcome = RunOutcome::default();

        loop {
            tokio::select! {
                result = &mut exec, if exec_result.is_none() => {
                    exec_result = Some(result);
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        ExecEvent::Task(task) => {
                            let Some(idx) = state.index_of(&task.host) else {
                                debug!("Event for unknown host {}", task.host);
                                continue;
                            };
                            task_logs[idx].push(task_log(&task));
                            state.set_log(idx, json!({ "tasks": task_logs[idx] }));
                            if !task.outcome.passes() {
                                let message = failure_message(&task);
                                warn!("{} on {} failed: {}", stage, task.host, message);
                                state.finish(idx, StageStatus::Failed, message.clone(), json!({ "tasks": task_logs[idx] }));
                                recorder.save(state).await;
                                outcome.failure = Some(format!("{}: {}", task.host, message));
                                break;
                            }
                            recorder.save(state).await;
                        }
                        ExecEvent::HostDone(host) => {
                            if let Some(idx) = state.index_of(&host) {
                                state.finish(idx, StageStatus::Success, "", json!({ "tasks": task_logs[idx] }));
                                recorder.save(state).await;
                            }
                            outcome.done.push(host);
                        }
                    }
                }
            }
        }

        // closing the channel stops a runner that is still going
        drop(rx);
        let exec_result = match exec_result {
            Some(result) => result,
            None => exec.await,
        };
        if let Err(e) = exec_result {
            warn!("{} run ended with an error: {}", stage, e);
            if outcome.failure.is_none() {
                outcome.failure = Some(e.to_string());
            }
        }

        // hosts the run never got to
        let reason = outcome
            .failure
            .clone()
            .unwrap_or_else(|| "host did not complete".to_string());
        for host in &hosts {
            if let Some(idx) = state.index_of(host) {
                if state.targets[idx].status == TargetStatus::InProgress {
                    state.finish(idx, StageStatus::Failed, format!("not completed: {}", reason), json!({ "tasks": task_logs[idx] }));
                    if outcome.failure.is_none() {
                        outcome.failure = Some(format!("{}: did not complete", host));
                    }
                }
            }
        }
        recorder.save(state).await;
        outcome
    }

    async fn rollback(
        &self,
        state: &mut JobState,
        recorder: &Recorder,
        flavor: HostFlavor,
        extra_vars: Value,
    ) -> Result<RolloutSummary, ReleaseError> {
        let key = state.job.ledger_key();
        let run = PlaybookRun {
            playbook: rollback_playbook(flavor),
            hosts: state.job.targets.clone(),
            extra_vars,
        };
        let outcome = self.execute(state, recorder, ROLLBACK_STAGE, run).await;
        self.apps.clear_done_hosts(&key).await?;

        let tag = image_tag(&state.job.image).to_string();
        Ok(match outcome.failure {
            None => RolloutSummary {
                status: DeployStatus::RolledBack,
                message: format!("rolled back {} host(s) to {}", state.targets.len(), tag),
                version: Some(tag),
            },
            Some(failure) => RolloutSummary {
                status: DeployStatus::Failed,
                message: format!("rollback failed: {}", failure),
                version: None,
            },
        })
    }
}

fn task_log(task: &TaskEvent) -> Value {
    json!({
        "task": task.task,
        "outcome": task.outcome,
        "msg": task.msg,
    })
}

fn failure_message(task: &TaskEvent) -> String {
    match task.outcome {
        TaskOutcome::Unreachable => {
            ReleaseError::RemoteExecutionUnreachable(format!("{} ({})", task.host, task.msg)).to_string()
        }
        _ => format!("task {} failed: {}", task.task, task.msg),
    }
}

#[async_trait]
impl Orchestrator for RemoteHostOrchestrator {
    async fn run(&self, state: &mut JobState, recorder: &Recorder) -> Result<RolloutSummary, ReleaseError> {
        let DeployMode::RemoteHost { flavor } = state.job.mode else {
            return Err(ReleaseError::ConfigInvalid(format!(
                "deploy {} is not a remote-host rollout",
                state.job.id
            )));
        };
        let app = self.apps.get(&state.job.module).await?;
        let key = state.job.ledger_key();

        if state.job.deploy_type == DeployType::Rollback {
            let vars = self
                .descriptors
                .host_vars(&app, &state.job.image, &state.job.targets)
                .await?;
            return self.rollback(state, recorder, flavor, vars).await;
        }

        let done: HashSet<String> = if flavor.tracks_partial() {
            self.apps.done_hosts(&key).await?
        } else {
            HashSet::new()
        };
        let acting: Vec<String> = state
            .job
            .targets
            .iter()
            .filter(|h| !done.contains(*h))
            .cloned()
            .collect();
        for host in state.job.targets.clone() {
            if done.contains(&host) {
                if let Some(idx) = state.index_of(&host) {
                    state.record(idx, DEPLOY_STAGE, StageStatus::Success, "completed by an earlier attempt");
                }
            }
        }
        info!(
            "Deploy {} acts on {} of {} host(s)",
            state.job.id,
            acting.len(),
            state.job.targets.len()
        );

        let tag = image_tag(&state.job.image).to_string();
        if !acting.is_empty() {
            let vars = self.descriptors.host_vars(&app, &state.job.image, &acting).await?;
            let run = PlaybookRun {
                playbook: deploy_playbook(flavor),
                hosts: acting.clone(),
                extra_vars: vars,
            };
            let outcome = self.execute(state, recorder, DEPLOY_STAGE, run).await;

            if let Some(failure) = outcome.failure {
                // hosts that finished before the failing task still count next time
                if flavor.tracks_partial() && !outcome.done.is_empty() {
                    self.apps.add_done_hosts(&key, &outcome.done).await?;
                }
                let status = if done.is_empty() && outcome.done.is_empty() {
                    DeployStatus::Failed
                } else {
                    DeployStatus::PartialFailed
                };
                return Ok(RolloutSummary {
                    status,
                    message: failure,
                    version: None,
                });
            }
            for host in &acting {
                if let Err(e) = self.apps.set_target_version(&app.id, host, &tag).await {
                    warn!("Failed to record version of {} on {}: {}", app.id, host, e);
                }
            }
        }

        let completed = if flavor.tracks_partial() {
            self.apps.add_done_hosts(&key, &acting).await?
        } else {
            self.apps.clear_done_hosts(&key).await?;
            state.job.targets.iter().cloned().collect()
        };
        let all_done = state.job.targets.iter().all(|h| completed.contains(h));

        Ok(if all_done {
            RolloutSummary {
                status: DeployStatus::Success,
                message: format!("{} host(s) deployed", state.job.targets.len()),
                version: Some(tag),
            }
        } else {
            RolloutSummary {
                status: DeployStatus::PartialSuccess,
                message: format!(
                    "{} of {} host(s) deployed",
                    state.job.targets.iter().filter(|h| completed.contains(*h)).count(),
                    state.job.targets.len()
                ),
                version: None,
            }
        })
    }
}
