//! Durable job results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::stage::TargetResult;
use crate::models::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Deploy,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Deploy => "deploy",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" | "builds" => Ok(JobKind::Build),
            "deploy" | "deploys" => Ok(JobKind::Deploy),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// Written once when a job reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: i32,
    pub status_name: String,
    #[serde(default)]
    pub message: Option<String>,
    pub per_target_stages: Vec<TargetResult>,
    /// Raw console text, builds only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_shape() {
        let result = JobResult {
            job_id: uuid::Uuid::nil(),
            kind: JobKind::Deploy,
            status: 1,
            status_name: "success".into(),
            message: None,
            per_target_stages: vec![TargetResult::new("k1")],
            console: None,
            finished_at: Utc::now(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("jobId").is_some());
        assert!(value.get("perTargetStages").is_some());
        assert!(value.get("finishedAt").is_some());
        assert!(value.get("console").is_none());
    }
}
