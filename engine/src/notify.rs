//! Terminal job notices
//!
//! Notices are sent after the job row was saved. Delivery problems are logged and
//! never change the job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapters::http::{Auth, HttpClient};
use crate::errors::ReleaseError;
use crate::models::result::JobKind;
use crate::models::JobId;
use crate::workers::queue::TaskQueue;

/// Outcome of one target, as shown in a notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub target: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub job_id: JobId,
    pub kind: JobKind,
    pub module: String,
    pub status: i32,
    pub status_name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetSummary>,
    #[serde(default)]
    pub version_from: Option<String>,
    #[serde(default)]
    pub version_to: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notices: &[Notice]) -> Result<(), ReleaseError>;
}

/// Posts notices to a webhook as a JSON array
pub struct WebhookNotifier {
    http: HttpClient,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, ReleaseError> {
        Ok(Self {
            http: HttpClient::new(url, Auth::None)?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notices: &[Notice]) -> Result<(), ReleaseError> {
        self.http.post_json("", notices).await?;
        Ok(())
    }
}

/// Writes notices to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notices: &[Notice]) -> Result<(), ReleaseError> {
        for notice in notices {
            info!(
                "{} {} of {} finished: {}",
                notice.kind.as_str(),
                notice.job_id,
                notice.module,
                notice.status_name
            );
        }
        Ok(())
    }
}

/// Front of the notification sink.
///
/// Notices of jobs that belong to a ticket are held for a short delay so that every
/// job of the ticket goes out in one message.
pub struct NotifyHub {
    sink: Arc<dyn Notifier>,
    queue: TaskQueue,
    merge_delay: Duration,
    pending: Arc<Mutex<HashMap<String, Vec<Notice>>>>,
}

impl NotifyHub {
    pub fn new(sink: Arc<dyn Notifier>, queue: TaskQueue, merge_delay: Duration) -> Self {
        Self {
            sink,
            queue,
            merge_delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn publish(&self, notice: Notice) {
        let Some(order_id) = notice.order_id.clone() else {
            deliver(self.sink.as_ref(), &[notice]).await;
            return;
        };

        let first = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let batch = pending.entry(order_id.clone()).or_default();
            batch.push(notice);
            batch.len() == 1
        };
        if !first {
            return;
        }

        let sink = self.sink.clone();
        let pending = self.pending.clone();
        self.queue.schedule(
            format!("notify:{}", order_id),
            self.merge_delay,
            async move {
                let batch = {
                    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.remove(&order_id).unwrap_or_default()
                };
                if !batch.is_empty() {
                    deliver(sink.as_ref(), &batch).await;
                }
            },
        );
    }
}

async fn deliver(sink: &dyn Notifier, notices: &[Notice]) {
    if let Err(e) = sink.notify(notices).await {
        warn!("Failed to deliver {} notice(s): {}", notices.len(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::queue;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<Vec<Notice>>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, notices: &[Notice]) -> Result<(), ReleaseError> {
            self.calls.lock().unwrap().push(notices.to_vec());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _: &[Notice]) -> Result<(), ReleaseError> {
            Err(ReleaseError::Internal("sink down".into()))
        }
    }

    fn notice(order_id: Option<&str>) -> Notice {
        Notice {
            job_id: uuid::Uuid::new_v4(),
            kind: JobKind::Deploy,
            module: "api".into(),
            status: 1,
            status_name: "success".into(),
            message: None,
            targets: Vec::new(),
            version_from: Some("v1".into()),
            version_to: Some("v2".into()),
            actor: Some("ops".into()),
            order_id: order_id.map(String::from),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_notices_are_merged() {
        let sink = Arc::new(Recording::default());
        let (task_queue, receiver) = TaskQueue::new();
        let worker = tokio::spawn(async move {
            queue::run(&queue::Options::default(), receiver, Box::pin(futures::future::pending())).await;
        });
        let hub = NotifyHub::new(sink.clone(), task_queue, Duration::from_secs(10));

        hub.publish(notice(Some("T-1"))).await;
        hub.publish(notice(Some("T-1"))).await;
        hub.publish(notice(None)).await;
        assert_eq!(sink.calls.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].len(), 2);
        drop(calls);
        worker.abort();
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let (task_queue, _receiver) = TaskQueue::new();
        let hub = NotifyHub::new(Arc::new(Failing), task_queue, Duration::from_secs(1));
        hub.publish(notice(None)).await;
    }
}
