//! Release service: the surface shared by the HTTP server and the app runner

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::build::controller::BuildController;
use crate::deploy::DeployController;
use crate::errors::ReleaseError;
use crate::models::result::{JobKind, JobResult};
use crate::models::JobId;
use crate::progress::watcher::{self, Frame};
use crate::storage::jobs::{require_build, require_deploy};
use crate::storage::Stores;

/// Frames of one job; dropping it stops the watcher behind it
pub struct Subscription {
    pub frames: mpsc::Receiver<Frame>,
    _cancel: oneshot::Sender<()>,
}

pub struct ReleaseService {
    builds: Arc<BuildController>,
    deploys: DeployController,
    stores: Stores,
    watch: watcher::Options,
}

impl ReleaseService {
    pub fn new(
        builds: Arc<BuildController>,
        deploys: DeployController,
        stores: Stores,
        watch: watcher::Options,
    ) -> Self {
        Self {
            builds,
            deploys,
            stores,
            watch,
        }
    }

    pub fn builds(&self) -> &Arc<BuildController> {
        &self.builds
    }

    pub fn deploys(&self) -> &DeployController {
        &self.deploys
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Durable result of a finished job
    pub async fn result(&self, job_id: &JobId) -> Result<JobResult, ReleaseError> {
        self.stores
            .results
            .get(job_id)
            .await?
            .ok_or_else(|| ReleaseError::NotFound(format!("result of {}", job_id)))
    }

    /// Follow the progress of one job
    pub async fn subscribe(&self, kind: JobKind, job_id: JobId) -> Result<Subscription, ReleaseError> {
        match kind {
            JobKind::Build => {
                require_build(self.stores.jobs.as_ref(), &job_id).await?;
            }
            JobKind::Deploy => {
                require_deploy(self.stores.jobs.as_ref(), &job_id).await?;
            }
        }

        let (tx, rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let options = self.watch.clone();
        let progress = self.stores.progress.clone();
        tokio::spawn(async move {
            watcher::run(
                &options,
                progress.as_ref(),
                kind,
                job_id,
                tx,
                tokio::time::sleep,
                Box::pin(async move {
                    let _ = cancel_rx.await;
                }),
            )
            .await;
        });
        debug!("Subscribed to {} {}", kind.as_str(), job_id);

        Ok(Subscription {
            frames: rx,
            _cancel: cancel_tx,
        })
    }
}
