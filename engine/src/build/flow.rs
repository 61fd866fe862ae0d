//! Queue binding and stage-flow polling

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::adapters::build_server::{BuildServer, FlowStatus, StageFlow};
use crate::build::completion::Resolution;
use crate::errors::ReleaseError;
use crate::models::build::BuildStatus;
use crate::models::stage::{StageResult, StageStatus, TargetResult, TargetStatus};
use crate::poll::{poll_until, PollError, PollPolicy, Check};

pub const QUEUEING_TIMEOUT: &str = "queueing timeout";
pub const EXECUTION_TIMEOUT: &str = "execution timeout";

/// Stage-flow polling thresholds
#[derive(Debug, Clone)]
pub struct FlowTimeouts {
    pub interval: Duration,
    /// Longest a run may stay not executed
    pub queueing: Duration,
    /// Longest a run may stay in progress
    pub execution: Duration,
}

impl FlowTimeouts {
    /// Enough attempts to observe the execution threshold being crossed
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        (self.execution.as_millis() / interval) as u32 + 2
    }
}

/// Terminal build status for a flow status, `None` while the run is pending
pub fn terminal_status(status: &FlowStatus) -> Option<BuildStatus> {
    match status {
        FlowStatus::Success => Some(BuildStatus::Success),
        FlowStatus::Failed => Some(BuildStatus::Failed),
        FlowStatus::Aborted => Some(BuildStatus::Aborted),
        FlowStatus::NotExecuted | FlowStatus::InProgress | FlowStatus::Other(_) => None,
    }
}

/// Resolution for a flow that reached a terminal status
pub fn finished(status: BuildStatus, flow: &StageFlow) -> Resolution {
    let failed_stage = flow
        .stages
        .iter()
        .find(|s| matches!(s.status, FlowStatus::Failed | FlowStatus::Aborted));
    let message = match failed_stage {
        Some(stage) => format!("pipeline {} at stage {}", status.name(), stage.name),
        None => format!("pipeline {}", status.name()),
    };
    Resolution::Finished {
        status,
        message: Some(message),
    }
}

/// Poll the queue item until the build server assigns a build number
pub async fn bind_number(
    server: &dyn BuildServer,
    queue: u64,
    policy: &PollPolicy,
) -> Result<u64, ReleaseError> {
    let result = poll_until(policy, |attempt| async move {
        match server.queue_item(queue).await {
            Ok(item) if item.cancelled => Check::Fail(item.why),
            Ok(item) => match item.build_number {
                Some(number) => Check::Ready(number),
                None => {
                    debug!("Queue item {} still waiting ({}): {:?}", queue, attempt, item.why);
                    Check::Pending(item.why)
                }
            },
            Err(e) => {
                warn!("Failed to read queue item {}: {}", queue, e);
                Check::Pending(Some(e.to_string()))
            }
        }
    })
    .await;

    match result {
        Ok(number) => Ok(number),
        Err(PollError::Timeout { attempts, .. }) => {
            Err(ReleaseError::QueueBindTimeout { queue, attempts })
        }
        Err(PollError::Failed(why)) => Err(ReleaseError::BuildServer(format!(
            "queue item {} cancelled: {}",
            queue,
            why.unwrap_or_default()
        ))),
    }
}

/// What a pending check saw
#[derive(Debug)]
enum Observed {
    Waiting(FlowStatus),
    Exceeded(&'static str),
}

/// Poll the stage flow of a bound build until it ends or a threshold is crossed.
///
/// `on_tick` sees every flow read while the run is pending.
pub async fn await_flow<F, Fut>(
    server: &dyn BuildServer,
    job_name: &str,
    number: u64,
    timeouts: &FlowTimeouts,
    on_tick: F,
) -> Resolution
where
    F: Fn(StageFlow) -> Fut + Sync,
    Fut: Future<Output = ()> + Send,
{
    let policy = PollPolicy::fixed(timeouts.max_attempts(), timeouts.interval);
    let on_tick = &on_tick;
    let result = poll_until(&policy, |attempt| async move {
        let elapsed = timeouts.interval * attempt;
        let flow = match server.stage_flow(job_name, number).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!("Failed to read stage flow of {}#{}: {}", job_name, number, e);
                return Check::Pending(Observed::Waiting(FlowStatus::Other(e.to_string())));
            }
        };
        if let Some(status) = terminal_status(&flow.status) {
            return Check::Ready(finished(status, &flow));
        }
        let status = flow.status.clone();
        on_tick(flow).await;
        match status {
            FlowStatus::NotExecuted if elapsed > timeouts.queueing => {
                Check::Fail(Observed::Exceeded(QUEUEING_TIMEOUT))
            }
            _ if elapsed > timeouts.execution => Check::Fail(Observed::Exceeded(EXECUTION_TIMEOUT)),
            status => Check::Pending(Observed::Waiting(status)),
        }
    })
    .await;

    match result {
        Ok(resolution) => resolution,
        Err(PollError::Failed(Observed::Exceeded(reason))) => Resolution::TimedOut(reason.to_string()),
        Err(PollError::Failed(Observed::Waiting(_))) => {
            Resolution::TimedOut(EXECUTION_TIMEOUT.to_string())
        }
        Err(PollError::Timeout { last, .. }) => match last {
            Some(Observed::Waiting(FlowStatus::NotExecuted)) => {
                Resolution::TimedOut(QUEUEING_TIMEOUT.to_string())
            }
            _ => Resolution::TimedOut(EXECUTION_TIMEOUT.to_string()),
        },
    }
}

/// Per-stage result of a finished build, laid out one after another from `started_at`
pub fn flow_target(
    target: String,
    status: BuildStatus,
    flow: Option<&StageFlow>,
    started_at: DateTime<Utc>,
) -> TargetResult {
    let mut cursor = started_at;
    let stages = flow
        .map(|flow| flow.stages.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|stage| {
            let stage_status = match stage.status {
                FlowStatus::Success => StageStatus::Success,
                FlowStatus::NotExecuted | FlowStatus::InProgress
                    if status == BuildStatus::TimedOut =>
                {
                    StageStatus::TimedOut
                }
                FlowStatus::NotExecuted | FlowStatus::InProgress => StageStatus::Pending,
                FlowStatus::Failed | FlowStatus::Aborted | FlowStatus::Other(_) => {
                    StageStatus::Failed
                }
            };
            let begin = cursor;
            let end = begin + chrono::Duration::milliseconds(stage.duration_millis as i64);
            cursor = end + chrono::Duration::microseconds(1);
            StageResult {
                name: stage.name.clone(),
                status: stage_status,
                message: String::new(),
                log: serde_json::json!({ "durationMillis": stage.duration_millis }),
                started_at: begin,
                finished_at: Some(end),
            }
        })
        .collect();

    TargetResult {
        target,
        status: match status {
            BuildStatus::Success => TargetStatus::Success,
            BuildStatus::TimedOut => TargetStatus::TimedOut,
            _ => TargetStatus::Failed,
        },
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::build_server::FlowStage;

    #[test]
    fn test_terminal_mapping() {
        assert_eq!(terminal_status(&FlowStatus::Success), Some(BuildStatus::Success));
        assert_eq!(terminal_status(&FlowStatus::Failed), Some(BuildStatus::Failed));
        assert_eq!(terminal_status(&FlowStatus::Aborted), Some(BuildStatus::Aborted));
        assert_eq!(terminal_status(&FlowStatus::NotExecuted), None);
        assert_eq!(terminal_status(&FlowStatus::InProgress), None);
    }

    #[test]
    fn test_max_attempts_cover_execution_threshold() {
        let timeouts = FlowTimeouts {
            interval: Duration::from_secs(1),
            queueing: Duration::from_secs(600),
            execution: Duration::from_secs(900),
        };
        assert_eq!(timeouts.max_attempts(), 902);
    }

    #[test]
    fn test_flow_target_orders_stages() {
        let flow = StageFlow {
            status: FlowStatus::Failed,
            stages: vec![
                FlowStage {
                    name: "checkout".into(),
                    status: FlowStatus::Success,
                    duration_millis: 1200,
                },
                FlowStage {
                    name: "build".into(),
                    status: FlowStatus::Failed,
                    duration_millis: 0,
                },
            ],
        };
        let target = flow_target("web-build#7".into(), BuildStatus::Failed, Some(&flow), Utc::now());
        assert_eq!(target.status, TargetStatus::Failed);
        assert_eq!(target.stages[1].status, StageStatus::Failed);
        assert!(target.stages[1].started_at > target.stages[0].finished_at.unwrap());
    }
}
