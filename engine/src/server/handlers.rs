//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use release_api::models::{
    AcceptanceRequest, BatchStatusResponse, BuildCallback, BuildRequest, DeployRequest,
    ErrorResponse, HealthResponse, JobAccepted, JobSummary, StoppedResponse, VersionResponse,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::build::controller::BuildOrder;
use crate::deploy::DeployOrder;
use crate::errors::ReleaseError;
use crate::models::build::{BuildJob, CommitDescriptor, RefKind};
use crate::models::deploy::{DeployJob, DeployType};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError(pub ReleaseError);

impl From<ReleaseError> for ApiError {
    fn from(err: ReleaseError) -> Self {
        ApiError(err)
    }
}

pub fn status_of(err: &ReleaseError) -> StatusCode {
    match err {
        ReleaseError::NotFound(_) => StatusCode::NOT_FOUND,
        ReleaseError::DuplicateCommit { .. }
        | ReleaseError::QueueBusy(_)
        | ReleaseError::InvalidTransition(_)
        | ReleaseError::AlreadyPersisted(_) => StatusCode::CONFLICT,
        ReleaseError::ValidationError(_) | ReleaseError::ConfigInvalid(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ReleaseError::BuildServer(_)
        | ReleaseError::Cluster(_)
        | ReleaseError::Registry(_)
        | ReleaseError::ApplyFailed(_)
        | ReleaseError::RemoteExecution(_)
        | ReleaseError::RemoteExecutionUnreachable(_)
        | ReleaseError::HttpError(_)
        | ReleaseError::HttpStatus { .. } => StatusCode::BAD_GATEWAY,
        ReleaseError::QueueBindTimeout { .. }
        | ReleaseError::VerificationTimeout(_)
        | ReleaseError::StageTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "release-engine".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

fn build_summary(job: &BuildJob) -> JobSummary {
    JobSummary {
        id: job.id,
        module: job.module.clone(),
        status: job.status.code(),
        status_name: job.status.name().to_string(),
        message: job.message.clone(),
        batch_uuid: job.batch_uuid,
        created_at: job.created_at,
        finished_at: job.finished_at,
    }
}

fn deploy_summary(job: &DeployJob) -> JobSummary {
    JobSummary {
        id: job.id,
        module: job.module.clone(),
        status: job.status.code(),
        status_name: job.status.name().to_string(),
        message: job.message.clone(),
        batch_uuid: job.batch_uuid,
        created_at: job.created_at,
        finished_at: job.finished_at,
    }
}

fn build_order(request: BuildRequest) -> Result<BuildOrder, ReleaseError> {
    let kind: RefKind = request
        .commit
        .kind
        .parse()
        .map_err(ReleaseError::ValidationError)?;
    if request.commit.name.trim().is_empty() || request.commit.short_id.trim().is_empty() {
        return Err(ReleaseError::ValidationError(
            "commit name and short_id are required".to_string(),
        ));
    }
    let commit = CommitDescriptor {
        kind,
        name: request.commit.name,
        short_id: request.commit.short_id,
    };
    let mut order = BuildOrder::new(request.module, commit);
    order.image_tag = request.image_tag;
    order.batch_uuid = request.batch_uuid;
    order.deployer = request.deployer;
    order.deploy_after = request.deploy_after;
    order.force_rebuild = request.force_rebuild;
    order.targets = request.targets;
    Ok(order)
}

fn deploy_order(request: DeployRequest) -> Result<DeployOrder, ReleaseError> {
    let deploy_type = DeployType::try_from(request.deploy_type).map_err(ReleaseError::ValidationError)?;
    let mut order = DeployOrder::new(request.module, request.image, request.targets);
    order.deploy_type = deploy_type;
    order.order_id = request.order_id;
    order.partial_acceptance = request.partial_acceptance;
    order.batch_uuid = request.batch_uuid;
    order.actor = request.actor;
    Ok(order)
}

// ================================== BUILDS ====================================== //

pub async fn create_build_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = build_order(request)?;
    let id = state.service.builds().request_build(order).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { id })))
}

pub async fn get_build_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.builds().get(&id).await?;
    Ok(Json(job))
}

pub async fn stop_build_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let stopped = state.service.builds().stop(&id).await?;
    Ok(Json(StoppedResponse { stopped }))
}

pub async fn reset_build_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.builds().reset(&id).await?;
    Ok(Json(build_summary(&job)))
}

pub async fn retry_build_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.builds().retry(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(build_summary(&job))))
}

pub async fn active_builds_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiError> {
    let builds = state.service.builds().active().await?;
    Ok(Json(builds.iter().map(build_summary).collect::<Vec<_>>()))
}

pub async fn build_batch_handler(
    State(state): State<Arc<ServerState>>,
    Path(batch_uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, members) = state.service.builds().batch_status(&batch_uuid).await?;
    Ok(Json(BatchStatusResponse {
        batch_uuid,
        status: status.code(),
        status_name: status.name().to_string(),
        members: members.iter().map(build_summary).collect(),
    }))
}

pub async fn build_callback_handler(
    State(state): State<Arc<ServerState>>,
    Json(callback): Json<BuildCallback>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .builds()
        .on_callback(&callback.job_id, &callback.module)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ================================== DEPLOYS ===================================== //

pub async fn create_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = deploy_order(request)?;
    let id = state.service.deploys().request_deploy(order).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { id })))
}

pub async fn get_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.deploys().get(&id).await?;
    Ok(Json(job))
}

pub async fn retry_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.deploys().retry(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(deploy_summary(&job))))
}

pub async fn latest_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(module): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.deploys().latest(&module).await?;
    Ok(Json(deploy_summary(&job)))
}

pub async fn accept_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<AcceptanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .service
        .deploys()
        .review_acceptance(&id, request.accept, request.message)
        .await?;
    Ok(Json(deploy_summary(&job)))
}

pub async fn deploy_batch_handler(
    State(state): State<Arc<ServerState>>,
    Path(batch_uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, members) = state.service.deploys().batch_status(&batch_uuid).await?;
    Ok(Json(BatchStatusResponse {
        batch_uuid,
        status: status.code(),
        status_name: status.name().to_string(),
        members: members.iter().map(deploy_summary).collect(),
    }))
}

// ================================== RESULTS ===================================== //

pub async fn result_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.service.result(&id).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use release_api::models::CommitRequest;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&ReleaseError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&ReleaseError::DuplicateCommit {
                module: "web".into(),
                commit: "abc".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&ReleaseError::ValidationError("bad".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(&ReleaseError::BuildServer("down".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(&ReleaseError::QueueBindTimeout { queue: 7, attempts: 3 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(&ReleaseError::Internal("oops".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_build_order_from_request() {
        let request = BuildRequest {
            module: "web".into(),
            commit: CommitRequest {
                kind: "tags".into(),
                name: "v1.2".into(),
                short_id: "abc1234".into(),
            },
            image_tag: None,
            batch_uuid: None,
            deployer: Some("ops".into()),
            deploy_after: true,
            force_rebuild: false,
            targets: vec!["k1".into()],
        };
        let order = build_order(request).unwrap();
        assert_eq!(order.commit.kind, RefKind::Tags);
        assert!(order.deploy_after);
        assert_eq!(order.targets, vec!["k1".to_string()]);
    }

    #[test]
    fn test_unknown_ref_kind_is_rejected() {
        let request = BuildRequest {
            module: "web".into(),
            commit: CommitRequest {
                kind: "notes".into(),
                name: "x".into(),
                short_id: "abc".into(),
            },
            image_tag: None,
            batch_uuid: None,
            deployer: None,
            deploy_after: false,
            force_rebuild: false,
            targets: Vec::new(),
        };
        assert!(matches!(build_order(request), Err(ReleaseError::ValidationError(_))));
    }

    #[test]
    fn test_deploy_type_code() {
        let request = DeployRequest {
            module: "api".into(),
            image: "reg/p/api:v2".into(),
            targets: vec![],
            deploy_type: 2,
            order_id: Some("T-1".into()),
            partial_acceptance: false,
            batch_uuid: None,
            actor: None,
        };
        let order = deploy_order(request).unwrap();
        assert_eq!(order.deploy_type, DeployType::Rollback);

        let bad = DeployRequest {
            module: "api".into(),
            image: "reg/p/api:v2".into(),
            targets: vec![],
            deploy_type: 9,
            order_id: None,
            partial_acceptance: false,
            batch_uuid: None,
            actor: None,
        };
        assert!(deploy_order(bad).is_err());
    }
}
