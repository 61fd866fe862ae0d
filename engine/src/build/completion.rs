//! Single-assignment completion latch for builds
//!
//! A build finishes either through the push callback or through stage-flow polling.
//! Both paths call [`Completions::resolve`]; only the first call for a job returns
//! true, and only that caller finalizes the job.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::models::build::BuildStatus;
use crate::models::JobId;

/// How a build ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Finished {
        status: BuildStatus,
        message: Option<String>,
    },
    TimedOut(String),
    Stopped,
}

#[derive(Default)]
pub struct Completions {
    latches: Mutex<HashMap<JobId, watch::Sender<Option<Resolution>>>>,
}

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the latch of a job, creating it if needed
    pub fn subscribe(&self, job_id: JobId) -> watch::Receiver<Option<Resolution>> {
        let mut latches = self.latches.lock().unwrap_or_else(|e| e.into_inner());
        latches
            .entry(job_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Set the resolution. Returns false if the job was already resolved.
    pub fn resolve(&self, job_id: JobId, resolution: Resolution) -> bool {
        let mut latches = self.latches.lock().unwrap_or_else(|e| e.into_inner());
        let latch = latches
            .entry(job_id)
            .or_insert_with(|| watch::channel(None).0);
        latch.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(resolution);
            true
        })
    }

    /// Drop the latch of a finished or reset job
    pub fn forget(&self, job_id: &JobId) {
        let mut latches = self.latches.lock().unwrap_or_else(|e| e.into_inner());
        latches.remove(job_id);
    }
}

/// Wait until the latch is resolved, `None` if it was dropped first
pub async fn resolved(rx: &mut watch::Receiver<Option<Resolution>>) -> Option<Resolution> {
    let value = rx.wait_for(|r| r.is_some()).await.ok()?.clone();
    value
}
