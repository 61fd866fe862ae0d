//! Build job model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::JobId;

/// Status of one CI attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    NotBuilt,
    Success,
    Failed,
    InProgress,
    Aborted,
    TimedOut,
}

impl BuildStatus {
    pub fn code(&self) -> i32 {
        match self {
            BuildStatus::NotBuilt => 0,
            BuildStatus::Success => 1,
            BuildStatus::Failed => 2,
            BuildStatus::InProgress => 3,
            BuildStatus::Aborted => 4,
            BuildStatus::TimedOut => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildStatus::NotBuilt => "not_built",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Aborted => "aborted",
            BuildStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Aborted | BuildStatus::TimedOut
        )
    }
}

/// Kind of git ref being built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Heads,
    Tags,
}

impl std::str::FromStr for RefKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heads" | "branch" => Ok(RefKind::Heads),
            "tags" | "tag" => Ok(RefKind::Tags),
            other => Err(format!("unknown ref kind: {}", other)),
        }
    }
}

/// Which commit a build is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDescriptor {
    pub kind: RefKind,
    pub name: String,
    pub short_id: String,
}

impl CommitDescriptor {
    /// Ref passed to the build server, e.g. `origin/main` or `refs/tags/v1.2`
    pub fn build_ref(&self) -> String {
        match self.kind {
            RefKind::Heads => format!("origin/{}", self.name),
            RefKind::Tags => format!("refs/tags/{}", self.name),
        }
    }
}

/// One CI attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: JobId,
    pub module: String,
    pub status: BuildStatus,
    #[serde(default)]
    pub queue_number: Option<u64>,
    #[serde(default)]
    pub build_number: Option<u64>,
    pub commit: CommitDescriptor,
    pub image_tag: String,
    #[serde(default)]
    pub batch_uuid: Option<Uuid>,
    #[serde(default)]
    pub deployer: Option<String>,
    /// Hand off to a rollout on success
    #[serde(default)]
    pub deploy_after: bool,
    /// Rollout targets used by the handoff
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildJob {
    pub fn new(module: impl Into<String>, commit: CommitDescriptor, image_tag: Option<String>) -> Self {
        let created_at = Utc::now();
        let image_tag = image_tag.unwrap_or_else(|| default_image_tag(&created_at, &commit));
        Self {
            id: Uuid::new_v4(),
            module: module.into(),
            status: BuildStatus::NotBuilt,
            queue_number: None,
            build_number: None,
            commit,
            image_tag,
            batch_uuid: None,
            deployer: None,
            deploy_after: false,
            targets: Vec::new(),
            message: None,
            created_at,
            finished_at: None,
        }
    }

    /// Bind the external build number.
    ///
    /// Returns false (and changes nothing) when a number is already bound or when the
    /// job never made it into the queue.
    pub fn bind_number(&mut self, number: u64) -> bool {
        if self.build_number.is_some() || self.queue_number.is_none() {
            return false;
        }
        self.build_number = Some(number);
        true
    }
}

/// `20261018093000_abc1234`
pub fn default_image_tag(at: &DateTime<Utc>, commit: &CommitDescriptor) -> String {
    format!("{}_{}", at.format("%Y%m%d%H%M%S"), commit.short_id)
}

/// Aggregate status of a batch of builds
pub fn reduce_batch<I>(statuses: I) -> BuildStatus
where
    I: IntoIterator<Item = BuildStatus>,
{
    let statuses: Vec<BuildStatus> = statuses.into_iter().collect();
    if statuses.is_empty() {
        return BuildStatus::NotBuilt;
    }
    let any = |s: BuildStatus| statuses.iter().any(|x| *x == s);

    if any(BuildStatus::InProgress) {
        BuildStatus::InProgress
    } else if statuses.iter().all(|s| *s == BuildStatus::Success) {
        BuildStatus::Success
    } else if statuses.iter().all(|s| *s == BuildStatus::NotBuilt) {
        BuildStatus::NotBuilt
    } else if any(BuildStatus::Aborted) {
        BuildStatus::Aborted
    } else if any(BuildStatus::TimedOut) {
        BuildStatus::TimedOut
    } else {
        BuildStatus::Failed
    }
}
