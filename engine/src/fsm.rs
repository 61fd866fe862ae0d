//! Job lifecycle state machines
//!
//! Build and deploy rows only change status through `process`, which rejects any
//! transition not listed here.

use chrono::Utc;

use crate::errors::ReleaseError;
use crate::models::build::{BuildJob, BuildStatus};
use crate::models::deploy::{DeployJob, DeployStatus};

/// Build lifecycle event
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// The build server accepted the job into its queue
    Submitted { queue: u64 },

    /// The build reached a terminal status reported by the build server
    Finished { status: BuildStatus, message: Option<String> },

    /// A polling threshold was exceeded
    TimedOut(String),

    /// Stop was requested
    Stopped,

    /// Un-terminate for retry
    Reset,
}

impl BuildJob {
    /// Process an event and transition state
    pub fn process(&mut self, event: BuildEvent) -> Result<(), ReleaseError> {
        let new_status = match (&self.status, &event) {
            (BuildStatus::NotBuilt, BuildEvent::Submitted { queue }) => {
                self.queue_number = Some(*queue);
                self.message = None;
                BuildStatus::InProgress
            }

            (BuildStatus::InProgress, BuildEvent::Finished { status, message })
                if status.is_terminal() =>
            {
                self.message = message.clone();
                self.finished_at = Some(Utc::now());
                *status
            }
            (BuildStatus::InProgress, BuildEvent::TimedOut(message)) => {
                self.message = Some(message.clone());
                self.finished_at = Some(Utc::now());
                BuildStatus::TimedOut
            }
            (BuildStatus::InProgress, BuildEvent::Stopped) => {
                self.message = Some("stopped by request".to_string());
                self.finished_at = Some(Utc::now());
                BuildStatus::Aborted
            }

            (status, BuildEvent::Reset) if status.is_terminal() => {
                self.queue_number = None;
                self.build_number = None;
                self.message = None;
                self.finished_at = None;
                BuildStatus::NotBuilt
            }

            // Invalid transitions
            (status, event) => {
                return Err(ReleaseError::InvalidTransition(format!(
                    "build {}: {:?} -> {:?}",
                    self.id, status, event
                )));
            }
        };

        self.status = new_status;
        Ok(())
    }
}

/// Deploy lifecycle event
#[derive(Debug, Clone)]
pub enum DeployEvent {
    /// An orchestrator picked the job up
    Started,

    /// All targets reported
    Finished { status: DeployStatus, message: Option<String> },

    /// A partial rollout was accepted as is
    Accepted,

    /// A partial rollout was rejected on review
    Rejected(Option<String>),
}

impl DeployJob {
    /// Process an event and transition state
    pub fn process(&mut self, event: DeployEvent) -> Result<(), ReleaseError> {
        let new_status = match (&self.status, &event) {
            (
                DeployStatus::NotDeployed
                | DeployStatus::Failed
                | DeployStatus::TimedOut
                | DeployStatus::Unknown
                | DeployStatus::PartialSuccess
                | DeployStatus::PartialFailed,
                DeployEvent::Started,
            ) => {
                self.message = None;
                self.finished_at = None;
                DeployStatus::InProgress
            }

            (DeployStatus::InProgress, DeployEvent::Finished { status, message })
                if status.is_terminal() =>
            {
                self.message = message.clone();
                self.finished_at = Some(Utc::now());
                *status
            }

            (DeployStatus::PartialSuccess, DeployEvent::Accepted) => DeployStatus::PartialSuccess,
            (DeployStatus::PartialSuccess, DeployEvent::Rejected(message)) => {
                self.message = message.clone().or_else(|| Some("rejected on acceptance".to_string()));
                DeployStatus::RejectedAcceptance
            }

            // Invalid transitions
            (status, event) => {
                return Err(ReleaseError::InvalidTransition(format!(
                    "deploy {}: {:?} -> {:?}",
                    self.id, status, event
                )));
            }
        };

        self.status = new_status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::{CommitDescriptor, RefKind};
    use crate::models::deploy::{DeployMode, DeployType};

    fn build() -> BuildJob {
        BuildJob::new(
            "web",
            CommitDescriptor {
                kind: RefKind::Heads,
                name: "main".into(),
                short_id: "abc123".into(),
            },
            None,
        )
    }

    #[test]
    fn test_build_forward_only() {
        let mut job = build();
        job.process(BuildEvent::Submitted { queue: 4 }).unwrap();
        assert_eq!(job.status, BuildStatus::InProgress);
        assert_eq!(job.queue_number, Some(4));

        job.process(BuildEvent::Finished {
            status: BuildStatus::Success,
            message: None,
        })
        .unwrap();
        assert_eq!(job.status, BuildStatus::Success);
        assert!(job.finished_at.is_some());

        // terminal rows do not move again without a reset
        assert!(job.process(BuildEvent::Stopped).is_err());
        assert!(job.process(BuildEvent::Submitted { queue: 5 }).is_err());
    }

    #[test]
    fn test_build_finished_requires_terminal_status() {
        let mut job = build();
        job.process(BuildEvent::Submitted { queue: 1 }).unwrap();
        let result = job.process(BuildEvent::Finished {
            status: BuildStatus::InProgress,
            message: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_build_reset_clears_binding() {
        let mut job = build();
        job.process(BuildEvent::Submitted { queue: 1 }).unwrap();
        assert!(job.bind_number(3));
        job.process(BuildEvent::TimedOut("queueing timeout".into())).unwrap();
        assert_eq!(job.status, BuildStatus::TimedOut);

        job.process(BuildEvent::Reset).unwrap();
        assert_eq!(job.status, BuildStatus::NotBuilt);
        assert_eq!(job.build_number, None);
        assert_eq!(job.queue_number, None);
    }

    #[test]
    fn test_reset_rejected_while_running() {
        let mut job = build();
        job.process(BuildEvent::Submitted { queue: 1 }).unwrap();
        assert!(job.process(BuildEvent::Reset).is_err());
    }

    #[test]
    fn test_deploy_acceptance() {
        let mut job = DeployJob::new("api", "img:v1", vec!["h1".into()], DeployType::Update, DeployMode::Kubernetes);
        job.process(DeployEvent::Started).unwrap();
        job.process(DeployEvent::Finished {
            status: DeployStatus::PartialSuccess,
            message: None,
        })
        .unwrap();
        job.process(DeployEvent::Rejected(None)).unwrap();
        assert_eq!(job.status, DeployStatus::RejectedAcceptance);
        assert!(job.process(DeployEvent::Started).is_err());
    }
}
