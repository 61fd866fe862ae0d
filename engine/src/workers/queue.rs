//! Background task queue
//!
//! Job attempts are handed to the queue as independent units of work, either
//! immediately or after a countdown. The dispatcher bounds how many run at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    label: String,
    delay: Option<Duration>,
    task: BoxTask,
}

/// Queue worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum number of tasks running at once
    pub max_concurrency: usize,

    /// How long in-flight tasks may run after shutdown was requested
    pub drain_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Sending side of the queue
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
}

/// Receiving side, consumed by [`run`]
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }

    /// Run as soon as a slot is free
    pub fn spawn<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.push(label.into(), None, Box::pin(task));
    }

    /// Run once `delay` has elapsed
    pub fn schedule<F>(&self, label: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.push(label.into(), Some(delay), Box::pin(task));
    }

    fn push(&self, label: String, delay: Option<Duration>, task: BoxTask) {
        if self.tx.send(QueuedTask { label: label.clone(), delay, task }).is_err() {
            warn!("Task queue closed, dropping task {}", label);
        }
    }
}

/// Run the queue dispatcher
pub async fn run(
    options: &Options,
    mut receiver: TaskReceiver,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Task queue starting...");

    let permits = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Task queue shutting down...");
                break;
            }
            queued = receiver.rx.recv() => {
                let Some(queued) = queued else {
                    debug!("All task queue senders dropped");
                    break;
                };
                let permits = permits.clone();
                tasks.spawn(async move {
                    if let Some(delay) = queued.delay {
                        tokio::time::sleep(delay).await;
                    }
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    debug!("Running task {}", queued.label);
                    queued.task.await;
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("Queued task failed: {}", e);
                }
            }
        }
    }

    // Let in-flight work finish, then cut it off
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Queued task failed: {}", e);
            }
        }
    };
    if tokio::time::timeout(options.drain_timeout, drain).await.is_err() {
        warn!("Task queue drain timed out, aborting remaining tasks");
        tasks.abort_all();
    }
    info!("Task queue stopped");
}
