//! Periodic purge of expired progress entries

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::cache::progress::ProgressStore;

/// Sweeper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Run the sweeper worker
pub async fn run<S, F>(
    options: &Options,
    progress: &dyn ProgressStore,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Progress sweeper starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Progress sweeper shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match progress.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {} expired progress entries", purged),
            Err(e) => error!("Failed to purge progress entries: {}", e),
        }
    }
}
