use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use super::{types::*, QueueService};
use crate::domain::{entity::Service, error::QueueError};

pub fn router<S: QueueService>(service: S) -> Router {
    Router::new()
        .route("/create-queue", post(create_queue::<S>))
        .route("/queue-detail/:id", get(queue_detail::<S>))
        .route("/active-queue/:customer_id", get(active_queue::<S>))
        .route("/leave-queue/:id", post(leave_queue::<S>))
        .route("/queue-complete/:id", post(complete_queue::<S>))
        .route("/check-complete/:id", post(check_complete::<S>))
        .route("/transfer-queue", post(transfer_queue::<S>))
        .route("/queue-history/:customer_id", get(queue_history::<S>))
        .route("/services", post(create_service::<S>))
        .route("/services/:id", put(update_service::<S>))
        .route("/service-queues/:service_id", get(service_queue::<S>))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
            QueueError::NotOwner { .. } => StatusCode::FORBIDDEN,
            QueueError::InvalidTransition { .. }
            | QueueError::WindowExpired { .. }
            | QueueError::TransferDestinationUnavailable(_)
            | QueueError::ServiceInactive(_)
            | QueueError::SameDestination(_)
            | QueueError::AlreadyTransferred(_)
            | QueueError::InvalidArgument(_)
            | QueueError::EstimationUnavailable => StatusCode::BAD_REQUEST,
            QueueError::Store(e) => {
                error!("Store error: {:?}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error", "code": "store" })),
                )
                    .into_response();
            }
        };

        let body = json!({ "error": self.0.to_string(), "code": code(&self.0) });

        (status, Json(body)).into_response()
    }
}

fn code(e: &QueueError) -> &'static str {
    match e {
        QueueError::InvalidTransition { .. } => "invalid_transition",
        QueueError::WindowExpired { .. } => "window_expired",
        QueueError::NotFound { .. } => "not_found",
        QueueError::TransferDestinationUnavailable(_) => "transfer_destination_unavailable",
        QueueError::EstimationUnavailable => "estimation_unavailable",
        QueueError::ServiceInactive(_) => "service_inactive",
        QueueError::SameDestination(_) => "same_destination",
        QueueError::AlreadyTransferred(_) => "already_transferred",
        QueueError::NotOwner { .. } => "not_owner",
        QueueError::InvalidArgument(_) => "invalid_argument",
        QueueError::Store(_) => "store",
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn create_queue<S: QueueService>(
    State(service): State<S>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<JoinResponse> {
    Ok(Json(service.join(req).await?))
}

async fn queue_detail<S: QueueService>(
    State(service): State<S>,
    Path(id): Path<i64>,
) -> ApiResult<QueueDetail> {
    Ok(Json(service.detail(id).await?))
}

async fn active_queue<S: QueueService>(
    State(service): State<S>,
    Path(customer_id): Path<i64>,
) -> ApiResult<Option<QueueDetail>> {
    Ok(Json(service.active(customer_id).await?))
}

async fn leave_queue<S: QueueService>(
    State(service): State<S>,
    Path(id): Path<i64>,
) -> ApiResult<LeaveResponse> {
    Ok(Json(service.leave(id).await?))
}

async fn complete_queue<S: QueueService>(
    State(service): State<S>,
    Path(id): Path<i64>,
) -> ApiResult<CompleteResponse> {
    Ok(Json(service.complete(id).await?))
}

async fn check_complete<S: QueueService>(
    State(service): State<S>,
    Path(id): Path<i64>,
) -> ApiResult<CheckCompleteResponse> {
    Ok(Json(service.check_complete(id).await?))
}

async fn transfer_queue<S: QueueService>(
    State(service): State<S>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<TransferResponse> {
    Ok(Json(service.transfer(req).await?))
}

async fn queue_history<S: QueueService>(
    State(service): State<S>,
    Path(customer_id): Path<i64>,
) -> ApiResult<Vec<HistoryItem>> {
    Ok(Json(service.history(customer_id).await?))
}

async fn create_service<S: QueueService>(
    State(service): State<S>,
    Json(req): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<Service>), ApiError> {
    Ok((StatusCode::CREATED, Json(service.create_service(req).await?)))
}

async fn update_service<S: QueueService>(
    State(service): State<S>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateServiceRequest>,
) -> ApiResult<Service> {
    Ok(Json(service.update_service(id, req).await?))
}

async fn service_queue<S: QueueService>(
    State(service): State<S>,
    Path(service_id): Path<i64>,
) -> ApiResult<ServiceSummary> {
    Ok(Json(service.service_summary(service_id).await?))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
