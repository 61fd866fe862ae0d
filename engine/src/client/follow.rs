//! Follow a job's progress from the command line

use std::time::Duration;

use colored::Colorize;
use futures::{SinkExt, StreamExt};
use release_api::models::ProgressFrame;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, warn};
use url::Url;

use crate::errors::ReleaseError;
use crate::models::result::JobKind;
use crate::models::JobId;

/// Follow options
#[derive(Debug, Clone)]
pub struct Options {
    /// Engine base URL
    pub server_url: String,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8700".to_string(),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Parse `build/<id>` or `deploy/<id>`
pub fn parse_target(target: &str) -> Result<(JobKind, JobId), ReleaseError> {
    let (kind, id) = target
        .split_once('/')
        .ok_or_else(|| ReleaseError::ValidationError(format!("expected <kind>/<id>, got {}", target)))?;
    let kind: JobKind = kind.parse().map_err(ReleaseError::ValidationError)?;
    let id = id
        .parse()
        .map_err(|_| ReleaseError::ValidationError(format!("invalid job id: {}", id)))?;
    Ok((kind, id))
}

pub fn progress_url(server_url: &str, kind: JobKind, id: &JobId) -> Result<Url, ReleaseError> {
    let mut url = Url::parse(server_url).map_err(|e| ReleaseError::ConfigInvalid(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ReleaseError::ConfigInvalid(format!(
                "invalid server URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ReleaseError::ConfigInvalid("failed to set scheme".to_string()))?;
    url.set_path(&format!(
        "{}/ws/{}/{}",
        url.path().trim_end_matches('/'),
        kind.as_str(),
        id
    ));
    Ok(url)
}

/// One printable line per snapshot
pub fn render_snapshot(data: &Value) -> String {
    let status = data["statusName"].as_str().unwrap_or("unknown");
    let colored_status = match status {
        "success" => status.green(),
        "failed" | "aborted" | "partial_failed" | "rejected_acceptance" => status.red(),
        "timed_out" | "unknown" | "partial_success" => status.yellow(),
        _ => status.cyan(),
    };
    let mut line = format!(
        "{} {}",
        data["module"].as_str().unwrap_or_default().bold(),
        colored_status
    );

    if let Some(targets) = data["targets"].as_array() {
        for target in targets {
            let last = target["stages"]
                .as_array()
                .and_then(|stages| stages.last())
                .map(|stage| {
                    format!(
                        "{}:{}",
                        stage["name"].as_str().unwrap_or_default(),
                        stage["status"].as_str().unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| "-".to_string());
            line.push_str(&format!(
                "\n  {} {}",
                target["target"].as_str().unwrap_or_default(),
                last.dimmed()
            ));
        }
    } else if let Some(stages) = data["flow"]["stages"].as_array() {
        for stage in stages {
            line.push_str(&format!(
                "\n  {} {}",
                stage["name"].as_str().unwrap_or_default(),
                stage["status"].as_str().unwrap_or_default().dimmed()
            ));
        }
    }
    line
}

/// Print frames of one job until the server reports it done
pub async fn follow(options: &Options, kind: JobKind, id: JobId) -> Result<(), ReleaseError> {
    let url = progress_url(&options.server_url, kind, &id)?;
    debug!("Connecting to {}", url);

    let (mut ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| ReleaseError::ServerError(e.to_string()))?;

    let mut heartbeat_tick = tokio::time::interval(options.heartbeat_interval);
    loop {
        tokio::select! {
            _ = heartbeat_tick.tick() => {
                let heart = serde_json::json!({"heart": 1}).to_string();
                if let Err(e) = ws_stream.send(Message::Text(heart.into())).await {
                    warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ProgressFrame>(text.as_str()) {
                            Ok(ProgressFrame::Snapshot { data }) => println!("{}", render_snapshot(&data)),
                            Ok(ProgressFrame::Pong) => debug!("Pong received"),
                            Ok(ProgressFrame::Done) => {
                                println!("{}", "done".green().bold());
                                let _ = ws_stream.close(None).await;
                                return Ok(());
                            }
                            Err(e) => warn!("Unexpected frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => return Err(ReleaseError::ServerError(e.to_string())),
                    _ => {}
                }
            }
        }
    }
    Err(ReleaseError::ServerError(format!(
        "progress stream of {} {} closed before the job finished",
        kind.as_str(),
        id
    )))
}
