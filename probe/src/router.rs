use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api::{
    ApiError, CancelTestResponse, InitializeTestResponse, QueueStatusResponse, StartTestRequest,
    StartTestResponse, TestStatusResponse,
};
use crate::gateway::RequestGateway;
use crate::metrics::{setup_metrics_routes, track_metrics};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<RequestGateway>,
    pub liveness: health::HealthRegistry,
}

pub fn router(gateway: Arc<RequestGateway>, liveness: health::HealthRegistry, metrics: bool) -> Router {
    let state = AppState { gateway, liveness };

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/test/initialize", post(initialize_test))
        .route("/test/start", post(start_test))
        .route("/test/:test_id/status", get(test_status))
        .route("/queue/status", get(queue_status))
        .route("/test/:test_id", delete(cancel_test));

    let router = Router::new()
        .nest("/api/v1", api)
        .route("/_liveness", get(liveness_probe))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Installing a global recorder when the crate is used as a library
    // (during tests etc) does not work well, so it is opt-in.
    if metrics {
        setup_metrics_routes(router)
    } else {
        router
    }
}

async fn health_check(State(state): State<AppState>) -> Response {
    if state.liveness.healthy() {
        Json(serde_json::json!({"status": "ok"})).into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn liveness_probe(State(state): State<AppState>) -> Response {
    state.liveness.get_status().into_response()
}

async fn initialize_test(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<InitializeTestResponse>), ApiError> {
    let test_id = state.gateway.initialize_test().await?;
    Ok((StatusCode::CREATED, Json(InitializeTestResponse { test_id })))
}

async fn start_test(
    State(state): State<AppState>,
    Json(request): Json<StartTestRequest>,
) -> Result<(StatusCode, Json<StartTestResponse>), ApiError> {
    let ack = state
        .gateway
        .start_test(request.test_id, request.bucket, request.test_type)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartTestResponse {
            test_id: ack.test_id,
            accepted: ack.accepted,
            test_type: ack.test_type,
        }),
    ))
}

async fn test_status(
    State(state): State<AppState>,
    Path(test_id): Path<Uuid>,
) -> Result<Json<TestStatusResponse>, ApiError> {
    let status = state.gateway.get_status(test_id).await?;
    Ok(Json(status.into()))
}

#[derive(Deserialize)]
struct QueueStatusParams {
    #[serde(rename = "test-id")]
    test_id: Option<Uuid>,
}

/// Either the whole queue's count vector, or a single test's status when
/// `?test-id=` is given.
async fn queue_status(
    State(state): State<AppState>,
    Query(params): Query<QueueStatusParams>,
) -> Result<Response, ApiError> {
    match params.test_id {
        Some(test_id) => {
            let status = state.gateway.get_status(test_id).await?;
            Ok(Json(TestStatusResponse::from(status)).into_response())
        }
        None => {
            let snapshot = state.gateway.get_queue_status().await?;
            Ok(Json(QueueStatusResponse::from(snapshot)).into_response())
        }
    }
}

async fn cancel_test(
    State(state): State<AppState>,
    Path(test_id): Path<Uuid>,
) -> Result<Json<CancelTestResponse>, ApiError> {
    let ack = state.gateway.cancel_test(test_id).await?;
    Ok(Json(CancelTestResponse {
        test_id: ack.test_id,
        cancelled: ack.cancelled,
        message: ack.message,
    }))
}
