//! Release API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned by every failing route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Returned when a job has been accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub id: Uuid,
}

/// Commit to build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    /// "heads" or "tags"
    #[serde(default = "default_commit_kind")]
    pub kind: String,
    pub name: String,
    pub short_id: String,
}

fn default_commit_kind() -> String {
    "heads".to_string()
}

/// Build request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub module: String,
    pub commit: CommitRequest,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub batch_uuid: Option<Uuid>,
    #[serde(default)]
    pub deployer: Option<String>,
    #[serde(default)]
    pub deploy_after: bool,
    #[serde(default)]
    pub force_rebuild: bool,
    /// Targets used when `deploy_after` hands off to a rollout
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Deploy request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub module: String,
    pub image: String,
    pub targets: Vec<String>,
    /// 0 update, 1 new deploy, 2 rollback, 3 reiterate
    #[serde(default)]
    pub deploy_type: u8,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub partial_acceptance: bool,
    #[serde(default)]
    pub batch_uuid: Option<Uuid>,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Push notice from the build server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCallback {
    pub job_id: Uuid,
    pub module: String,
}

/// Acceptance decision for a partially rolled out job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceRequest {
    pub accept: bool,
    /// Reason recorded on rejection
    #[serde(default)]
    pub message: Option<String>,
}

/// Builds actually stopped by a stop request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoppedResponse {
    pub stopped: Vec<Uuid>,
}

/// Job summary returned by the lookup routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub module: String,
    pub status: i32,
    pub status_name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub batch_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregate status of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    pub batch_uuid: Uuid,
    pub status: i32,
    pub status_name: String,
    pub members: Vec<JobSummary>,
}

/// Frames sent from the server on a progress subscription
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressFrame {
    /// Latest stage snapshot for the job
    Snapshot { data: serde_json::Value },
    /// Reply to a client heartbeat
    Pong,
    /// The pipeline finished; no more frames follow
    Done,
}

/// Frames sent from the client on a progress subscription
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub heart: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ClientFrame {
    pub fn is_heartbeat(&self) -> bool {
        self.heart.is_some()
    }

    pub fn is_abort(&self) -> bool {
        self.message.as_deref() == Some("abort")
    }
}
