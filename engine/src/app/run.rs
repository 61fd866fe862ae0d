//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::cache::progress::ProgressStore;
use crate::errors::ReleaseError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::queue::{self, TaskReceiver};
use crate::workers::sweeper;

/// Run the release engine until `shutdown_signal` resolves
pub async fn run(
    engine_version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ReleaseError> {
    info!("Initializing release engine {}...", engine_version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    // held until shutdown; the queue worker stops once every sender is gone
    let app_state = match init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start the release engine: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    drop(app_state);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, ReleaseError> {
    let (app_state, receiver) = AppState::init(options).await?;
    let app_state = Arc::new(app_state);

    init_queue_worker(
        options.queue_worker.clone(),
        receiver,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    init_sweeper_worker(
        options.sweeper.clone(),
        app_state.stores.progress.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    if options.enable_server {
        init_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(app_state)
}

async fn init_queue_worker(
    options: queue::Options,
    receiver: TaskReceiver,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ReleaseError> {
    info!("Initializing task queue worker...");

    let queue_handle = tokio::spawn(async move {
        queue::run(
            &options,
            receiver,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_queue_worker_handle(queue_handle)?;
    Ok(())
}

async fn init_sweeper_worker(
    options: sweeper::Options,
    progress: Arc<dyn ProgressStore>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ReleaseError> {
    info!("Initializing progress sweeper...");

    let sweeper_handle = tokio::spawn(async move {
        sweeper::run(
            &options,
            progress.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_sweeper_worker_handle(sweeper_handle)?;
    Ok(())
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ReleaseError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(app_state.service.clone())
        .with_heartbeat_timeout(options.settings.timing.heartbeat_timeout());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    server_handle: Option<JoinHandle<Result<(), ReleaseError>>>,
    queue_worker_handle: Option<JoinHandle<()>>,
    sweeper_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            server_handle: None,
            queue_worker_handle: None,
            sweeper_worker_handle: None,
        }
    }

    pub fn with_queue_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ReleaseError> {
        if self.queue_worker_handle.is_some() {
            return Err(ReleaseError::ShutdownError("queue_handle already set".to_string()));
        }
        self.queue_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_sweeper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ReleaseError> {
        if self.sweeper_worker_handle.is_some() {
            return Err(ReleaseError::ShutdownError("sweeper_handle already set".to_string()));
        }
        self.sweeper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ReleaseError>>,
    ) -> Result<(), ReleaseError> {
        if self.server_handle.is_some() {
            return Err(ReleaseError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ReleaseError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ReleaseError> {
        info!("Shutting down release engine...");

        // 1. Server, so no new jobs arrive
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| ReleaseError::ShutdownError(e.to_string()))??;
        }

        // 2. Sweeper
        if let Some(handle) = self.sweeper_worker_handle.take() {
            handle.await.map_err(|e| ReleaseError::ShutdownError(e.to_string()))?;
        }

        // 3. Task queue, draining in-flight job attempts
        if let Some(handle) = self.queue_worker_handle.take() {
            handle.await.map_err(|e| ReleaseError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
