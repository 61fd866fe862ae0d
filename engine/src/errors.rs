//! Error types for the release engine

use thiserror::Error;

/// Main error type for the release engine
#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// A target adapter could not be constructed
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Build queue busy: {0}")]
    QueueBusy(String),

    #[error("Commit {commit} of {module} was already built successfully")]
    DuplicateCommit { module: String, commit: String },

    #[error("Queue item {queue} was not bound to a build after {attempts} attempts")]
    QueueBindTimeout { queue: u64, attempts: u32 },

    #[error("Rollout verification timed out: {0}")]
    VerificationTimeout(String),

    #[error("Stage timed out: {0}")]
    StageTimeout(String),

    #[error("Apply failed: {0}")]
    ApplyFailed(String),

    #[error("Remote hosts unreachable: {0}")]
    RemoteExecutionUnreachable(String),

    #[error("Remote execution error: {0}")]
    RemoteExecution(String),

    #[error("Build server error: {0}")]
    BuildServer(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Result already persisted for job {0}")]
    AlreadyPersisted(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReleaseError {
    /// Whether a remote API answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReleaseError::HttpStatus { status: 404, .. } | ReleaseError::NotFound(_))
    }

    /// Whether the caller may retry the same request without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReleaseError::QueueBusy(_)
                | ReleaseError::QueueBindTimeout { .. }
                | ReleaseError::VerificationTimeout(_)
                | ReleaseError::StageTimeout(_)
                | ReleaseError::HttpError(_)
        ) || matches!(self, ReleaseError::HttpStatus { status, .. } if *status >= 500)
    }

    /// Short machine readable name, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            ReleaseError::IoError(_) => "io",
            ReleaseError::JsonError(_) => "json",
            ReleaseError::HttpError(_) => "http",
            ReleaseError::HttpStatus { .. } => "http_status",
            ReleaseError::ConfigInvalid(_) => "config_invalid",
            ReleaseError::QueueBusy(_) => "queue_busy",
            ReleaseError::DuplicateCommit { .. } => "duplicate_commit",
            ReleaseError::QueueBindTimeout { .. } => "queue_bind_timeout",
            ReleaseError::VerificationTimeout(_) => "verification_timeout",
            ReleaseError::StageTimeout(_) => "stage_timeout",
            ReleaseError::ApplyFailed(_) => "apply_failed",
            ReleaseError::RemoteExecutionUnreachable(_) => "remote_unreachable",
            ReleaseError::RemoteExecution(_) => "remote_execution",
            ReleaseError::BuildServer(_) => "build_server",
            ReleaseError::Cluster(_) => "cluster",
            ReleaseError::Registry(_) => "registry",
            ReleaseError::Descriptor(_) => "descriptor",
            ReleaseError::StorageError(_) => "storage",
            ReleaseError::AlreadyPersisted(_) => "already_persisted",
            ReleaseError::InvalidTransition(_) => "invalid_transition",
            ReleaseError::ValidationError(_) => "validation",
            ReleaseError::NotFound(_) => "not_found",
            ReleaseError::ServerError(_) => "server",
            ReleaseError::ShutdownError(_) => "shutdown",
            ReleaseError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(ReleaseError::QueueBusy("busy".into()).is_retryable());
        assert!(ReleaseError::QueueBindTimeout { queue: 1, attempts: 3 }.is_retryable());
        assert!(!ReleaseError::ConfigInvalid("bad".into()).is_retryable());
        assert!(!ReleaseError::ApplyFailed("nope".into()).is_retryable());
    }

    #[test]
    fn test_duplicate_commit_message() {
        let err = ReleaseError::DuplicateCommit {
            module: "web".into(),
            commit: "abc123".into(),
        };
        assert_eq!(err.kind(), "duplicate_commit");
        assert!(err.to_string().contains("abc123"));
    }
}
