//! Per-target stage records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Success,
    Failed,
    TimedOut,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending)
    }
}

/// Kubernetes pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeStage {
    Connect,
    ImageSync,
    Ensure,
    Apply,
    Verify,
}

impl KubeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            KubeStage::Connect => "connect",
            KubeStage::ImageSync => "image_sync",
            KubeStage::Ensure => "ensure",
            KubeStage::Apply => "apply",
            KubeStage::Verify => "verify",
        }
    }
}

/// One stage of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    #[serde(default)]
    pub message: String,
    /// Structured log payload (diagnostics, per-host task output, ...)
    #[serde(default)]
    pub log: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            message: String::new(),
            log: serde_json::Value::Null,
            started_at,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    TimedOut,
}

/// Ordered stage list for one cluster or host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target: String,
    pub status: TargetStatus,
    #[serde(default)]
    pub stages: Vec<StageResult>,
}

impl TargetResult {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: TargetStatus::Pending,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Per-target status from its stages: all success is success, any timeout dominates,
/// anything else is a failure. A target without stages has not run.
pub fn reduce_target(stages: &[StageResult]) -> TargetStatus {
    if stages.is_empty() {
        return TargetStatus::Pending;
    }
    if stages.iter().any(|s| s.status == StageStatus::Pending) {
        return TargetStatus::InProgress;
    }
    if stages.iter().all(|s| s.status == StageStatus::Success) {
        TargetStatus::Success
    } else if stages.iter().any(|s| s.status == StageStatus::TimedOut) {
        TargetStatus::TimedOut
    } else {
        TargetStatus::Failed
    }
}
