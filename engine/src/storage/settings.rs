//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;
use crate::models::app::AppModule;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,

    /// Also write rolling log files under the data directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for durable results and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// External build server
    #[serde(default)]
    pub build_server: BuildServerSettings,

    /// Source image registry
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Known clusters
    #[serde(default)]
    pub clusters: Vec<ClusterSettings>,

    /// Application modules
    #[serde(default)]
    pub apps: Vec<AppModule>,

    /// Remote host execution
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Notification sink
    #[serde(default)]
    pub notify: NotifySettings,

    /// Polling and timeout knobs
    #[serde(default)]
    pub timing: TimingSettings,

    /// Candidate artifacts kept per module
    #[serde(default = "default_artifact_retention")]
    pub artifact_retention: usize,

    /// Replace existing workloads instead of patching them
    #[serde(default = "default_true")]
    pub force_replace: bool,

    /// Directory of per-module workload descriptors (`{module}.json`)
    #[serde(default)]
    pub descriptor_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/release-engine")
}

fn default_artifact_retention() -> usize {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            data_dir: default_data_dir(),
            server: ServerSettings::default(),
            build_server: BuildServerSettings::default(),
            registry: RegistrySettings::default(),
            clusters: Vec::new(),
            apps: Vec::new(),
            remote: RemoteSettings::default(),
            notify: NotifySettings::default(),
            timing: TimingSettings::default(),
            artifact_retention: default_artifact_retention(),
            force_replace: true,
            descriptor_dir: None,
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8700
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Build server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildServerSettings {
    /// Base URL of the CI server
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub user: String,

    /// API token
    #[serde(default)]
    pub token: String,

    /// URL the build pipeline posts its completion notice to
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Repository holding the pipeline scripts
    #[serde(default)]
    pub pipeline_repo: String,

    /// Credentials the build server uses to check out `pipeline_repo`
    #[serde(default)]
    pub credentials_id: String,

    /// Pipeline script path inside `pipeline_repo`
    #[serde(default = "default_script_path")]
    pub script_path: String,
}

fn default_script_path() -> String {
    "Jenkinsfile".to_string()
}

impl Default for BuildServerSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user: String::new(),
            token: String::new(),
            callback_url: None,
            pipeline_repo: String::new(),
            credentials_id: String::new(),
            script_path: default_script_path(),
        }
    }
}

/// Image registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user: "admin".to_string(),
            password: String::new(),
        }
    }
}

/// One Kubernetes cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub id: String,

    /// API server URL
    pub api_url: String,

    /// Bearer token of a service account
    #[serde(default)]
    pub token: String,

    /// Accept self-signed API server certificates
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Registry attached to this cluster, the source registry when absent
    #[serde(default)]
    pub registry: Option<RegistrySettings>,

    /// Registry project images are synced into, the module's project when absent
    #[serde(default)]
    pub registry_project: Option<String>,
}

/// Remote host execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Playbook runner executable
    #[serde(default = "default_program")]
    pub program: String,

    /// Directory holding the playbooks
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: PathBuf,
}

fn default_program() -> String {
    "ansible-playbook".to_string()
}

fn default_playbook_dir() -> PathBuf {
    PathBuf::from("/etc/release-engine/playbooks")
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            playbook_dir: default_playbook_dir(),
        }
    }
}

/// Notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Webhook receiving terminal job notices; notices are only logged when absent
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Delay before ticket-scoped notices are merged and sent
    #[serde(default = "default_notify_delay")]
    pub merge_delay_secs: u64,
}

fn default_notify_delay() -> u64 {
    10
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            merge_delay_secs: default_notify_delay(),
        }
    }
}

/// Polling and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_queue_bind_attempts")]
    pub queue_bind_attempts: u32,

    #[serde(default = "default_queue_bind_interval_ms")]
    pub queue_bind_interval_ms: u64,

    #[serde(default = "default_flow_poll_interval_ms")]
    pub flow_poll_interval_ms: u64,

    /// Not-executed threshold
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,

    /// In-progress threshold
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,

    #[serde(default = "default_revision_attempts")]
    pub revision_attempts: u32,

    #[serde(default = "default_revision_interval_ms")]
    pub revision_interval_ms: u64,

    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    #[serde(default = "default_watch_confirmations")]
    pub watch_confirmations: u32,

    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,

    /// Delay before a timed out build's progress entry is purged
    #[serde(default = "default_timeout_cleanup_secs")]
    pub timeout_cleanup_secs: u64,

    /// Silence after which a progress subscriber is dropped
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

fn default_queue_bind_attempts() -> u32 {
    600
}

fn default_queue_bind_interval_ms() -> u64 {
    500
}

fn default_flow_poll_interval_ms() -> u64 {
    1000
}

fn default_queue_timeout_secs() -> u64 {
    600
}

fn default_execution_timeout_secs() -> u64 {
    900
}

fn default_verify_attempts() -> u32 {
    30
}

fn default_verify_interval_secs() -> u64 {
    6
}

fn default_revision_attempts() -> u32 {
    5
}

fn default_revision_interval_ms() -> u64 {
    1000
}

fn default_watch_interval_ms() -> u64 {
    500
}

fn default_watch_confirmations() -> u32 {
    5
}

fn default_progress_ttl_secs() -> u64 {
    1800
}

fn default_timeout_cleanup_secs() -> u64 {
    300
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            queue_bind_attempts: default_queue_bind_attempts(),
            queue_bind_interval_ms: default_queue_bind_interval_ms(),
            flow_poll_interval_ms: default_flow_poll_interval_ms(),
            queue_timeout_secs: default_queue_timeout_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            verify_attempts: default_verify_attempts(),
            verify_interval_secs: default_verify_interval_secs(),
            revision_attempts: default_revision_attempts(),
            revision_interval_ms: default_revision_interval_ms(),
            watch_interval_ms: default_watch_interval_ms(),
            watch_confirmations: default_watch_confirmations(),
            progress_ttl_secs: default_progress_ttl_secs(),
            timeout_cleanup_secs: default_timeout_cleanup_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl TimingSettings {
    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}
