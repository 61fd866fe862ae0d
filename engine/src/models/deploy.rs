//! Deploy job model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::stage::{TargetResult, TargetStatus};
use crate::models::JobId;
use crate::utils::short_digest;

/// Status of one CD attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    NotDeployed,
    Success,
    Failed,
    InProgress,
    TimedOut,
    Unknown,
    PartialSuccess,
    PartialFailed,
    RejectedAcceptance,
    RolledBack,
}

impl DeployStatus {
    pub fn code(&self) -> i32 {
        match self {
            DeployStatus::NotDeployed => 0,
            DeployStatus::Success => 1,
            DeployStatus::Failed => 2,
            DeployStatus::InProgress => 3,
            DeployStatus::TimedOut => 4,
            DeployStatus::Unknown => 5,
            DeployStatus::PartialSuccess => 11,
            DeployStatus::PartialFailed => 12,
            DeployStatus::RejectedAcceptance => 13,
            DeployStatus::RolledBack => 14,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeployStatus::NotDeployed => "not_deployed",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
            DeployStatus::InProgress => "in_progress",
            DeployStatus::TimedOut => "timed_out",
            DeployStatus::Unknown => "unknown",
            DeployStatus::PartialSuccess => "partial_success",
            DeployStatus::PartialFailed => "partial_failed",
            DeployStatus::RejectedAcceptance => "rejected_acceptance",
            DeployStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeployStatus::NotDeployed | DeployStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployType {
    Update,
    NewDeploy,
    Rollback,
    Reiterate,
}

impl TryFrom<u8> for DeployType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DeployType::Update),
            1 => Ok(DeployType::NewDeploy),
            2 => Ok(DeployType::Rollback),
            3 => Ok(DeployType::Reiterate),
            other => Err(format!("unknown deploy type: {}", other)),
        }
    }
}

/// Remote host packaging flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostFlavor {
    Jar,
    Web,
    Docker,
}

impl HostFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostFlavor::Jar => "jar",
            HostFlavor::Web => "web",
            HostFlavor::Docker => "docker",
        }
    }

    /// Whether repeated attempts only act on hosts not yet done
    pub fn tracks_partial(&self) -> bool {
        !matches!(self, HostFlavor::Web)
    }
}

/// How an application is rolled out, fixed when a job is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeployMode {
    Kubernetes,
    RemoteHost { flavor: HostFlavor },
}

/// One CD attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJob {
    pub id: JobId,
    pub uniq_key: String,
    pub module: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: DeployStatus,
    pub image: String,
    pub targets: Vec<String>,
    pub deploy_type: DeployType,
    pub mode: DeployMode,
    #[serde(default)]
    pub batch_uuid: Option<Uuid>,
    #[serde(default)]
    pub partial_acceptance: bool,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeployJob {
    pub fn new(
        module: impl Into<String>,
        image: impl Into<String>,
        targets: Vec<String>,
        deploy_type: DeployType,
        mode: DeployMode,
    ) -> Self {
        let module = module.into();
        let image = image.into();
        let mut sorted = targets.clone();
        sorted.sort();
        let joined = sorted.join(",");
        let uniq_key = format!(
            "{}-{}",
            module,
            short_digest(&[&module, &image, &joined])
        );
        Self {
            id: Uuid::new_v4(),
            uniq_key,
            module,
            order_id: None,
            status: DeployStatus::NotDeployed,
            image,
            targets,
            deploy_type,
            mode,
            batch_uuid: None,
            partial_acceptance: false,
            actor: None,
            message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Scope of the persistent host-completion set
    pub fn ledger_key(&self) -> String {
        let scope = self.order_id.as_deref().unwrap_or(&self.uniq_key);
        format!("batchdeploy::{}::{}", self.module, scope)
    }
}

/// Job status from per-target outcomes.
///
/// Every target is counted: success only when all of them succeeded, any timeout
/// dominates, some successes make a partial failure.
pub fn reduce_targets(targets: &[TargetResult]) -> DeployStatus {
    if targets.is_empty() {
        return DeployStatus::Failed;
    }
    if targets
        .iter()
        .any(|t| matches!(t.status, TargetStatus::Pending | TargetStatus::InProgress))
    {
        return DeployStatus::InProgress;
    }
    let succeeded = targets
        .iter()
        .filter(|t| t.status == TargetStatus::Success)
        .count();

    if succeeded == targets.len() {
        DeployStatus::Success
    } else if targets.iter().any(|t| t.status == TargetStatus::TimedOut) {
        DeployStatus::TimedOut
    } else if succeeded > 0 {
        DeployStatus::PartialFailed
    } else {
        DeployStatus::Failed
    }
}

/// Aggregate status of a batch of deploys
pub fn reduce_batch<I>(statuses: I) -> DeployStatus
where
    I: IntoIterator<Item = DeployStatus>,
{
    let statuses: Vec<DeployStatus> = statuses.into_iter().collect();
    if statuses.is_empty() {
        return DeployStatus::NotDeployed;
    }
    if statuses.contains(&DeployStatus::InProgress) {
        DeployStatus::InProgress
    } else if statuses.iter().all(|s| *s == DeployStatus::Success) {
        DeployStatus::Success
    } else if statuses.contains(&DeployStatus::TimedOut) {
        DeployStatus::TimedOut
    } else if statuses
        .iter()
        .any(|s| matches!(s, DeployStatus::Success | DeployStatus::PartialSuccess))
    {
        DeployStatus::PartialFailed
    } else {
        DeployStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(status: TargetStatus) -> TargetResult {
        TargetResult {
            status,
            ..TargetResult::new("k")
        }
    }

    #[test]
    fn test_success_only_when_every_target_succeeds() {
        use TargetStatus::*;
        assert_eq!(reduce_targets(&[target(Success), target(Success)]), DeployStatus::Success);
        assert_eq!(reduce_targets(&[target(Failed), target(Success)]), DeployStatus::PartialFailed);
        assert_eq!(reduce_targets(&[target(TimedOut), target(Success)]), DeployStatus::TimedOut);
        assert_eq!(reduce_targets(&[target(Failed), target(Failed)]), DeployStatus::Failed);
        assert_eq!(reduce_targets(&[target(Success), target(Pending)]), DeployStatus::InProgress);
        assert_eq!(reduce_targets(&[]), DeployStatus::Failed);
    }

    #[test]
    fn test_ledger_key_prefers_order() {
        let mut job = DeployJob::new(
            "api",
            "harbor/shop/api:v1",
            vec!["h2".into(), "h1".into()],
            DeployType::Update,
            DeployMode::RemoteHost { flavor: HostFlavor::Jar },
        );
        assert!(job.ledger_key().starts_with("batchdeploy::api::api-"));
        job.order_id = Some("T-9".into());
        assert_eq!(job.ledger_key(), "batchdeploy::api::T-9");
    }

    #[test]
    fn test_uniq_key_ignores_target_order() {
        let mode = DeployMode::Kubernetes;
        let a = DeployJob::new("api", "img:v1", vec!["a".into(), "b".into()], DeployType::Update, mode);
        let b = DeployJob::new("api", "img:v1", vec!["b".into(), "a".into()], DeployType::Update, mode);
        assert_eq!(a.uniq_key, b.uniq_key);
    }

    #[test]
    fn test_deploy_type_codes() {
        assert_eq!(DeployType::try_from(2), Ok(DeployType::Rollback));
        assert!(DeployType::try_from(9).is_err());
        assert_eq!(DeployStatus::RolledBack.code(), 14);
    }
}
