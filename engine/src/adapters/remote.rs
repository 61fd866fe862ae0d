//! Remote execution adapter
//!
//! Runs one playbook against a host set and streams per-task results back over a
//! channel. Dropping the receiver stops the run.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::ReleaseError;

/// One playbook invocation
#[derive(Debug, Clone)]
pub struct PlaybookRun {
    pub playbook: String,
    pub hosts: Vec<String>,
    pub extra_vars: serde_json::Value,
}

/// Result of one task on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Ok,
    Changed,
    Skipped,
    Failed,
    Unreachable,
}

impl TaskOutcome {
    /// ok, changed and skipped pass; failed and unreachable fail
    pub fn passes(&self) -> bool {
        matches!(self, TaskOutcome::Ok | TaskOutcome::Changed | TaskOutcome::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub host: String,
    pub task: String,
    pub outcome: TaskOutcome,
    pub msg: String,
    pub output: serde_json::Value,
}

/// Streamed execution event
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    Task(TaskEvent),
    /// Every task of the run completed on this host
    HostDone(String),
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run to completion, sending events as they happen
    async fn run(&self, run: PlaybookRun, events: mpsc::Sender<ExecEvent>) -> Result<(), ReleaseError>;
}

/// `ansible-playbook` runner reading the jsonl callback output
pub struct AnsibleRunner {
    program: String,
    playbook_dir: PathBuf,
}

impl AnsibleRunner {
    pub fn new(program: impl Into<String>, playbook_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            playbook_dir: playbook_dir.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "_event")]
    event: String,
    #[serde(default)]
    hosts: HashMap<String, serde_json::Value>,
    #[serde(default)]
    task: Option<RawTask>,
    #[serde(default)]
    stats: HashMap<String, RawStats>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawStats {
    #[serde(default)]
    failures: u32,
    #[serde(default)]
    unreachable: u32,
}

/// Tracks hosts of the current play batch and turns raw callback lines into events
#[derive(Debug, Default)]
pub struct EventParser {
    batch: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_batch(&mut self) -> Vec<ExecEvent> {
        let done = self
            .batch
            .iter()
            .filter(|h| !self.failed.contains(*h))
            .map(|h| ExecEvent::HostDone(h.clone()))
            .collect();
        self.batch.clear();
        done
    }

    /// Parse one output line. Lines that are not callback events yield nothing.
    pub fn parse_line(&mut self, line: &str) -> Vec<ExecEvent> {
        let raw: RawEvent = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };

        let outcome = match raw.event.as_str() {
            // serial plays start again for every host batch
            "v2_playbook_on_play_start" => return self.close_batch(),
            "v2_playbook_on_stats" => {
                for (host, stats) in &raw.stats {
                    if stats.failures > 0 || stats.unreachable > 0 {
                        self.failed.insert(host.clone());
                    }
                }
                return self.close_batch();
            }
            "v2_runner_on_ok" => None,
            "v2_runner_on_failed" => Some(TaskOutcome::Failed),
            "v2_runner_on_unreachable" => Some(TaskOutcome::Unreachable),
            "v2_runner_on_skipped" => Some(TaskOutcome::Skipped),
            _ => return Vec::new(),
        };

        let task = raw.task.map(|t| t.name).unwrap_or_default();
        let mut events = Vec::new();
        for (host, output) in raw.hosts {
            let outcome = outcome.unwrap_or_else(|| {
                if output.get("changed").and_then(|c| c.as_bool()).unwrap_or(false) {
                    TaskOutcome::Changed
                } else {
                    TaskOutcome::Ok
                }
            });
            if !outcome.passes() {
                self.failed.insert(host.clone());
            }
            self.batch.insert(host.clone());
            let msg = output
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            events.push(ExecEvent::Task(TaskEvent {
                host,
                task: task.clone(),
                outcome,
                msg,
                output,
            }));
        }
        events
    }
}

#[async_trait]
impl RemoteExecutor for AnsibleRunner {
    async fn run(&self, run: PlaybookRun, events: mpsc::Sender<ExecEvent>) -> Result<(), ReleaseError> {
        let playbook = self.playbook_dir.join(&run.playbook);
        let inventory = format!("{},", run.hosts.join(","));
        info!(
            "Running {} against {} host(s)",
            playbook.display(),
            run.hosts.len()
        );

        let mut child = Command::new(&self.program)
            .arg("-i")
            .arg(&inventory)
            .arg("--extra-vars")
            .arg(run.extra_vars.to_string())
            .arg(&playbook)
            .env("ANSIBLE_STDOUT_CALLBACK", "ansible.posix.jsonl")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ReleaseError::RemoteExecution(format!("failed to start {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReleaseError::RemoteExecution("runner stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = EventParser::new();

        while let Some(line) = lines.next_line().await? {
            for event in parser.parse_line(&line) {
                if events.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping {}", playbook.display());
                    if let Err(e) = child.kill().await {
                        warn!("Failed to stop runner: {}", e);
                    }
                    return Ok(());
                }
            }
        }

        let status = child.wait().await?;
        debug!("Runner for {} exited with {}", playbook.display(), status);
        Ok(())
    }
}
