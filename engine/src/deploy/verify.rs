//! Rollout verification
//!
//! A rollout is verified once the deployment carries a revision, the replica set of
//! that revision is fully available and one of its pods runs with a ready container.
//! The running tag is read from the replica set template.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::adapters::cluster::{ClusterApi, Resource};
use crate::errors::ReleaseError;
use crate::poll::{poll_until, PollError, PollPolicy, Check};
use crate::storage::settings::TimingSettings;
use crate::utils::image_tag;

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub attempts: u32,
    pub interval: Duration,
    /// Revision annotation checks per attempt
    pub revision_attempts: u32,
    pub revision_interval: Duration,
}

impl VerifyOptions {
    pub fn from_timing(timing: &TimingSettings) -> Self {
        Self {
            attempts: timing.verify_attempts,
            interval: Duration::from_secs(timing.verify_interval_secs),
            revision_attempts: timing.revision_attempts,
            revision_interval: Duration::from_millis(timing.revision_interval_ms),
        }
    }
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self::from_timing(&TimingSettings::default())
    }
}

/// Why verification did not pass
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyFailure {
    /// The replica set runs another tag
    Mismatch { expected: String, actual: String },
    /// Attempts exhausted; carries the last observed pod status
    Timeout { last: Value },
    Api(String),
}

impl VerifyFailure {
    pub fn diagnostic(&self) -> Value {
        match self {
            VerifyFailure::Mismatch { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            VerifyFailure::Timeout { last } => json!({ "lastPodStatus": last }),
            VerifyFailure::Api(message) => json!({ "error": message }),
        }
    }

    pub fn message(&self) -> String {
        match self {
            VerifyFailure::Mismatch { expected, actual } => {
                format!("running tag {} does not match expected {}", actual, expected)
            }
            VerifyFailure::Timeout { .. } => {
                ReleaseError::VerificationTimeout("rollout did not become ready".to_string())
                    .to_string()
            }
            VerifyFailure::Api(message) => message.clone(),
        }
    }
}

/// One attempt's view
#[derive(Debug)]
enum Observed {
    Waiting(Value),
    Mismatch { expected: String, actual: String },
}

fn selector(labels: &Value) -> String {
    labels
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| format!("{}={}", k, v.as_str().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

fn revision(object: &Value) -> Option<&str> {
    object["metadata"]["annotations"][REVISION_ANNOTATION].as_str()
}

fn replicas_ready(status: &Value) -> bool {
    let count = |field: &str| status[field].as_u64().unwrap_or(0);
    let available = count("availableReplicas");
    available > 0 && available == count("fullyLabeledReplicas") && available == count("readyReplicas")
}

fn pod_running(pod: &Value) -> bool {
    let status = &pod["status"];
    let running = status["phase"]
        .as_str()
        .map(|p| p.eq_ignore_ascii_case("running"))
        .unwrap_or(false);
    let container = &status["containerStatuses"][0];
    running && container["ready"].as_bool() == Some(true) && container["state"].get("running").is_some()
}

/// Wait for the deployment's revision annotation
async fn await_revision(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    options: &VerifyOptions,
) -> Result<Option<String>, ReleaseError> {
    let policy = PollPolicy::fixed(options.revision_attempts, options.revision_interval);
    let result = poll_until(&policy, |_| async move {
        match api.get(Resource::Deployment, namespace, name).await {
            Ok(Some(deployment)) => match revision(&deployment) {
                Some(rev) => Check::Ready(rev.to_string()),
                None => Check::Pending(None),
            },
            Ok(None) => Check::Pending(None),
            Err(e) => Check::Fail(Some(e)),
        }
    })
    .await;

    match result {
        Ok(rev) => Ok(Some(rev)),
        Err(PollError::Failed(Some(e))) => Err(e),
        Err(_) => Ok(None),
    }
}

async fn check_once(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    expected_tag: &str,
    options: &VerifyOptions,
) -> Result<Check<Value, Observed>, ReleaseError> {
    let Some(rev) = await_revision(api, namespace, name, options).await? else {
        return Ok(Check::Pending(Observed::Waiting(json!({ "reason": "no revision" }))));
    };
    let Some(deployment) = api.get(Resource::Deployment, namespace, name).await? else {
        return Ok(Check::Pending(Observed::Waiting(json!({ "reason": "deployment missing" }))));
    };

    let labels = selector(&deployment["spec"]["selector"]["matchLabels"]);
    let replica_sets = api.list(Resource::ReplicaSet, namespace, &labels).await?;
    let Some(rs) = replica_sets.iter().find(|rs| revision(rs) == Some(rev.as_str())) else {
        return Ok(Check::Pending(Observed::Waiting(
            json!({ "reason": format!("no replica set for revision {}", rev) }),
        )));
    };

    let image = rs["spec"]["template"]["spec"]["containers"][0]["image"]
        .as_str()
        .unwrap_or_default();
    let actual = image_tag(image);
    if actual != expected_tag {
        return Ok(Check::Fail(Observed::Mismatch {
            expected: expected_tag.to_string(),
            actual: actual.to_string(),
        }));
    }

    let pods = api
        .list(Resource::Pod, namespace, &selector(&rs["spec"]["selector"]["matchLabels"]))
        .await?;
    let mut last = Value::Null;
    if replicas_ready(&rs["status"]) {
        if let Some(pod) = pods.iter().find(|p| pod_running(p)) {
            return Ok(Check::Ready(json!({
                "pod": pod["metadata"]["name"],
                "revision": rev,
                "availableReplicas": rs["status"]["availableReplicas"],
                "fullyLabeledReplicas": rs["status"]["fullyLabeledReplicas"],
                "readyReplicas": rs["status"]["readyReplicas"],
            })));
        }
    }
    if let Some(pod) = pods.last() {
        last = pod["status"].clone();
    }
    Ok(Check::Pending(Observed::Waiting(last)))
}

/// Poll until the rollout of `name` runs `expected_tag`.
///
/// Returns a readiness summary of the verified replica set.
pub async fn verify_rollout(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    expected_tag: &str,
    options: &VerifyOptions,
) -> Result<Value, VerifyFailure> {
    let policy = PollPolicy::fixed(options.attempts, options.interval);
    let result = poll_until(&policy, |attempt| async move {
        debug!("Verifying {}/{} ({})", namespace, name, attempt + 1);
        match check_once(api, namespace, name, expected_tag, options).await {
            Ok(check) => check,
            // transient API failures count as a pending attempt
            Err(e) => Check::Pending(Observed::Waiting(json!({ "error": e.to_string() }))),
        }
    })
    .await;

    match result {
        Ok(summary) => Ok(summary),
        Err(PollError::Failed(Observed::Mismatch { expected, actual })) => {
            Err(VerifyFailure::Mismatch { expected, actual })
        }
        Err(PollError::Failed(Observed::Waiting(last))) => Err(VerifyFailure::Timeout { last }),
        Err(PollError::Timeout { last, .. }) => Err(VerifyFailure::Timeout {
            last: match last {
                Some(Observed::Waiting(value)) => value,
                _ => Value::Null,
            },
        }),
    }
}
