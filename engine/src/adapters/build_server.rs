//! External build server adapter

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::adapters::http::{Auth, HttpClient};
use crate::errors::ReleaseError;

/// Status of a pipeline run or one of its stages, as reported by the flow description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowStatus {
    NotExecuted,
    InProgress,
    Success,
    Failed,
    Aborted,
    Other(String),
}

impl From<String> for FlowStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "NOT_EXECUTED" => FlowStatus::NotExecuted,
            "IN_PROGRESS" | "PAUSED_PENDING_INPUT" => FlowStatus::InProgress,
            "SUCCESS" => FlowStatus::Success,
            "FAILED" | "FAILURE" | "UNSTABLE" => FlowStatus::Failed,
            "ABORTED" => FlowStatus::Aborted,
            _ => FlowStatus::Other(s),
        }
    }
}

impl From<FlowStatus> for String {
    fn from(status: FlowStatus) -> Self {
        match status {
            FlowStatus::NotExecuted => "NOT_EXECUTED".to_string(),
            FlowStatus::InProgress => "IN_PROGRESS".to_string(),
            FlowStatus::Success => "SUCCESS".to_string(),
            FlowStatus::Failed => "FAILED".to_string(),
            FlowStatus::Aborted => "ABORTED".to_string(),
            FlowStatus::Other(s) => s,
        }
    }
}

/// One stage of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStage {
    pub name: String,
    pub status: FlowStatus,
    #[serde(default)]
    pub duration_millis: u64,
}

/// Stage-flow description of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFlow {
    pub status: FlowStatus,
    #[serde(default)]
    pub stages: Vec<FlowStage>,
}

impl StageFlow {
    pub fn not_executed() -> Self {
        Self {
            status: FlowStatus::NotExecuted,
            stages: Vec::new(),
        }
    }
}

/// State of a queue item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueItem {
    pub build_number: Option<u64>,
    pub cancelled: bool,
    pub why: Option<String>,
}

/// Operations the engine needs from a CI server
#[async_trait]
pub trait BuildServer: Send + Sync {
    /// Current job definition, `None` if the job does not exist
    async fn job_config(&self, name: &str) -> Result<Option<String>, ReleaseError>;

    async fn create_job(&self, name: &str, config: &str) -> Result<(), ReleaseError>;

    async fn reconfig_job(&self, name: &str, config: &str) -> Result<(), ReleaseError>;

    /// Whether the job has a queued or running instance
    async fn is_busy(&self, name: &str) -> Result<bool, ReleaseError>;

    /// Trigger a build and return its queue number
    async fn build_job(&self, name: &str, params: &[(String, String)]) -> Result<u64, ReleaseError>;

    async fn queue_item(&self, queue: u64) -> Result<QueueItem, ReleaseError>;

    async fn stage_flow(&self, name: &str, number: u64) -> Result<StageFlow, ReleaseError>;

    async fn console_text(&self, name: &str, number: u64) -> Result<String, ReleaseError>;

    /// Ask the server to halt a build; `NotFound` if it is unknown
    async fn stop(&self, name: &str, number: u64) -> Result<(), ReleaseError>;
}

/// Jenkins REST client
pub struct JenkinsClient {
    http: HttpClient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobInfo {
    #[serde(default)]
    in_queue: bool,
    #[serde(default)]
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueItemInfo {
    #[serde(default)]
    executable: Option<Executable>,
    #[serde(default)]
    cancelled: bool,
    #[serde(default)]
    why: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Executable {
    number: u64,
}

impl JenkinsClient {
    pub fn new(base_url: &str, user: &str, token: &str) -> Result<Self, ReleaseError> {
        Ok(Self {
            http: HttpClient::new(base_url, Auth::basic(user, token))?,
        })
    }

    fn job_path(name: &str) -> String {
        // folders are addressed as /job/a/job/b
        name.split('/')
            .map(|segment| format!("/job/{}", segment))
            .collect()
    }
}

/// Queue number from the `Location` header returned by `buildWithParameters`
pub fn queue_number_from_location(location: &str) -> Result<u64, ReleaseError> {
    let url = Url::parse(location)
        .map_err(|e| ReleaseError::BuildServer(format!("bad queue location {}: {}", location, e)))?;
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .and_then(|last| last.parse().ok())
        .ok_or_else(|| ReleaseError::BuildServer(format!("no queue number in {}", location)))
}

#[async_trait]
impl BuildServer for JenkinsClient {
    async fn job_config(&self, name: &str) -> Result<Option<String>, ReleaseError> {
        self.http
            .get_text_opt(&format!("{}/config.xml", Self::job_path(name)))
            .await
    }

    async fn create_job(&self, name: &str, config: &str) -> Result<(), ReleaseError> {
        info!("Creating build job {}", name);
        let (parent, leaf) = match name.rsplit_once('/') {
            Some((parent, leaf)) => (Self::job_path(parent), leaf),
            None => (String::new(), name),
        };
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("name", leaf)
            .finish();
        self.http
            .post_raw(
                &format!("{}/createItem?{}", parent, query),
                "application/xml",
                config.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn reconfig_job(&self, name: &str, config: &str) -> Result<(), ReleaseError> {
        info!("Reconfiguring build job {}", name);
        self.http
            .post_raw(
                &format!("{}/config.xml", Self::job_path(name)),
                "application/xml",
                config.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn is_busy(&self, name: &str) -> Result<bool, ReleaseError> {
        let info: JobInfo = self
            .http
            .get_json(&format!("{}/api/json?tree=inQueue,color", Self::job_path(name)))
            .await?;
        let running = info
            .color
            .as_deref()
            .map(|c| c.ends_with("_anime"))
            .unwrap_or(false);
        Ok(info.in_queue || running)
    }

    async fn build_job(&self, name: &str, params: &[(String, String)]) -> Result<u64, ReleaseError> {
        let response = self
            .http
            .post_form(&format!("{}/buildWithParameters", Self::job_path(name)), params)
            .await?;
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ReleaseError::BuildServer("build accepted without queue location".into()))?;
        let queue = queue_number_from_location(location)?;
        debug!("Build of {} queued as item {}", name, queue);
        Ok(queue)
    }

    async fn queue_item(&self, queue: u64) -> Result<QueueItem, ReleaseError> {
        let info: QueueItemInfo = self
            .http
            .get_json(&format!("/queue/item/{}/api/json", queue))
            .await?;
        Ok(QueueItem {
            build_number: info.executable.map(|e| e.number),
            cancelled: info.cancelled,
            why: info.why,
        })
    }

    async fn stage_flow(&self, name: &str, number: u64) -> Result<StageFlow, ReleaseError> {
        let flow = self
            .http
            .get_json_opt(&format!("{}/{}/wfapi/describe", Self::job_path(name), number))
            .await?;
        // the flow description only exists once the run has started
        Ok(flow.unwrap_or_else(StageFlow::not_executed))
    }

    async fn console_text(&self, name: &str, number: u64) -> Result<String, ReleaseError> {
        self.http
            .get_text(&format!("{}/{}/consoleText", Self::job_path(name), number))
            .await
    }

    async fn stop(&self, name: &str, number: u64) -> Result<(), ReleaseError> {
        match self
            .http
            .post_form(&format!("{}/{}/stop", Self::job_path(name), number), &[])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(ReleaseError::NotFound(format!("{}#{}", name, number))),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_number_from_location() {
        assert_eq!(
            queue_number_from_location("https://ci.local/queue/item/1234/").unwrap(),
            1234
        );
        assert!(queue_number_from_location("https://ci.local/queue/").is_err());
    }

    #[test]
    fn test_flow_status_mapping() {
        let flow: StageFlow = serde_json::from_str(
            r#"{"status":"FAILURE","stages":[{"name":"checkout","status":"SUCCESS","durationMillis":12},{"name":"build","status":"NOT_EXECUTED"}]}"#,
        )
        .unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(flow.stages[0].status, FlowStatus::Success);
        assert_eq!(flow.stages[1].status, FlowStatus::NotExecuted);
    }

    #[test]
    fn test_job_path_with_folders() {
        assert_eq!(JenkinsClient::job_path("shop/web-build"), "/job/shop/job/web-build");
    }
}
