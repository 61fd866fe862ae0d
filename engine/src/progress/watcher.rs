//! Progress watcher: forwards snapshot changes of one job to a subscriber

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::progress::{done_key, snapshot_key, ProgressStore};
use crate::models::result::JobKind;
use crate::models::JobId;
use crate::storage::settings::TimingSettings;

pub use release_api::models::ProgressFrame as Frame;

/// Watcher options
#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
    /// Snapshots forwarded after the terminal sentinel, before `Done`
    pub confirmations: u32,
    /// Stop a watcher whose job never finishes
    pub max_polls: u32,
}

impl Options {
    pub fn from_timing(timing: &TimingSettings) -> Self {
        let interval = Duration::from_millis(timing.watch_interval_ms);
        let lifetime = timing.progress_ttl().as_millis() / interval.as_millis().max(1);
        Self {
            interval,
            confirmations: timing.watch_confirmations,
            max_polls: lifetime as u32,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::from_timing(&TimingSettings::default())
    }
}

/// Run the watcher for one job until it is done, the subscriber leaves or shutdown
pub async fn run<S, F>(
    options: &Options,
    progress: &dyn ProgressStore,
    kind: JobKind,
    job_id: JobId,
    frames: mpsc::Sender<Frame>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    debug!("Watching {} {}", kind.as_str(), job_id);
    let snapshot = snapshot_key(kind, &job_id);
    let sentinel = done_key(kind, &job_id);

    let mut last: Option<serde_json::Value> = None;
    let mut confirmations_left: Option<u32> = None;
    let mut polls = 0;

    loop {
        if polls > 0 {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    debug!("Watcher of {} shutting down", job_id);
                    return;
                }
                _ = sleep_fn(options.interval) => {}
            }
        }
        polls += 1;
        if polls > options.max_polls {
            warn!("Watcher of {} {} gave up after {} polls", kind.as_str(), job_id, options.max_polls);
            return;
        }

        let current = match progress.get(&snapshot).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read progress of {}: {}", job_id, e);
                continue;
            }
        };

        if confirmations_left.is_none() {
            if let Ok(Some(_)) = progress.get(&sentinel).await {
                confirmations_left = Some(options.confirmations);
            }
        }

        let forward = match (&current, confirmations_left) {
            (None, _) => false,
            // after the sentinel every poll confirms the final snapshot
            (Some(_), Some(_)) => true,
            (Some(value), None) => last.as_ref() != Some(value),
        };
        if forward {
            if let Some(value) = current.clone() {
                if frames.send(Frame::Snapshot { data: value }).await.is_err() {
                    debug!("Subscriber of {} left", job_id);
                    return;
                }
            }
            last = current;
        }

        if let Some(left) = confirmations_left {
            if left == 0 {
                let _ = frames.send(Frame::Done).await;
                info!("Watcher of {} {} done", kind.as_str(), job_id);
                return;
            }
            confirmations_left = Some(left - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::progress::InMemoryProgressStore;
    use serde_json::json;

    fn options() -> Options {
        Options {
            interval: Duration::from_millis(10),
            confirmations: 5,
            max_polls: 100,
        }
    }

    async fn no_sleep(_: Duration) {
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_forwards_then_confirms_and_ends() {
        let store = InMemoryProgressStore::default();
        let id = uuid::Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        store
            .set(&snapshot_key(JobKind::Deploy, &id), json!({"status": 1}), ttl)
            .await
            .unwrap();
        store.set(&done_key(JobKind::Deploy, &id), json!(1), ttl).await.unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        run(
            &options(),
            &store,
            JobKind::Deploy,
            id,
            tx,
            no_sleep,
            Box::pin(std::future::pending::<()>()),
        )
        .await;

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        // first sighting plus five confirmations, then done
        assert_eq!(frames.len(), 7);
        assert_eq!(frames.last(), Some(&Frame::Done));
        assert!(frames[..6]
            .iter()
            .all(|f| *f == Frame::Snapshot { data: json!({"status": 1}) }));
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_not_repeated() {
        let store = InMemoryProgressStore::default();
        let id = uuid::Uuid::new_v4();
        store
            .set(&snapshot_key(JobKind::Build, &id), json!({"status": 3}), Duration::from_secs(60))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        let opts = Options {
            max_polls: 4,
            ..options()
        };
        run(&opts, &store, JobKind::Build, id, tx, no_sleep, Box::pin(std::future::pending::<()>())).await;

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        // max-polls guard ends the watcher without a done frame
        assert_eq!(frames, vec![Frame::Snapshot { data: json!({"status": 3}) }]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_watcher() {
        let store = InMemoryProgressStore::default();
        let (tx, _rx) = mpsc::channel(1);
        run(
            &options(),
            &store,
            JobKind::Build,
            uuid::Uuid::new_v4(),
            tx,
            tokio::time::sleep,
            Box::pin(async {}),
        )
        .await;
    }
}
