//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ReleaseError;
use crate::server::handlers::{
    accept_deploy_handler, active_builds_handler, build_batch_handler, build_callback_handler,
    create_build_handler, create_deploy_handler, deploy_batch_handler, get_build_handler,
    get_deploy_handler, health_handler, latest_deploy_handler, reset_build_handler,
    result_handler, retry_build_handler, retry_deploy_handler, stop_build_handler,
    version_handler,
};
use crate::server::progress_ws::progress_handler;
use crate::server::state::ServerState;

/// Routes of the engine API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Builds
        .route("/builds", post(create_build_handler))
        .route("/builds/active", get(active_builds_handler))
        .route("/builds/{id}", get(get_build_handler))
        .route("/builds/{id}/stop", post(stop_build_handler))
        .route("/builds/{id}/reset", post(reset_build_handler))
        .route("/builds/{id}/retry", post(retry_build_handler))
        .route("/builds/batch/{batch_uuid}", get(build_batch_handler))
        .route("/callbacks/build", post(build_callback_handler))
        // Deploys
        .route("/deploys", post(create_deploy_handler))
        .route("/deploys/{id}", get(get_deploy_handler))
        .route("/deploys/{id}/retry", post(retry_deploy_handler))
        .route("/deploys/{id}/acceptance", post(accept_deploy_handler))
        .route("/deploys/batch/{batch_uuid}", get(deploy_batch_handler))
        .route("/apps/{module}/deploys/latest", get(latest_deploy_handler))
        // Results and progress
        .route("/results/{id}", get(result_handler))
        .route("/ws/{kind}/{id}", get(progress_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ReleaseError>>, ReleaseError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ReleaseError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ReleaseError::ServerError(e.to_string()))
    });

    Ok(handle)
}
