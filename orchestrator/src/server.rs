use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::{
    job::Initiator,
    queue::QueueEntry,
    state::{AppState, CancelResponse, CancelStatus, StatusResponse, SubmitJobResponse},
};

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub uuid: Uuid,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(dream_streaming))
        .route("/healthz", get(healthz))
        .route("/dream", post(submit_job))
        .route("/job/get", get(get_job))
        .route("/job/stream", get(stream_job))
        .route("/job/cancel", get(cancel_job))
        .route("/job/delete", get(delete_job))
        .route("/job/list", get(list_jobs))
        .route("/job/image", get(job_image))
        .route("/status", get(status))
        .route("/gpu", get(gpu))
        .route("/telegraf", get(telegraf))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(payload): Json<Map<String, Value>>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let response = state
        .create_job(payload, Initiator::Api)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(response))
}

async fn dream_streaming(
    State(state): State<AppState>,
    Json(payload): Json<Map<String, Value>>,
) -> Result<Response, ApiError> {
    let response = state
        .create_job(payload, Initiator::Web)
        .await
        .map_err(ApiError::internal)?;
    Ok(ndjson(&state, response.uuid))
}

async fn get_job(
    State(state): State<AppState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    state
        .job_details(query.uuid)
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("UUID not found"))
}

async fn stream_job(
    State(state): State<AppState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    Ok(ndjson(&state, query.uuid))
}

async fn cancel_job(
    State(state): State<AppState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let Query(query) = query?;
    let status = state
        .cancel_job(query.uuid)
        .await
        .map_err(ApiError::internal)?;

    let status_code = match status {
        CancelStatus::CancellationRequested => StatusCode::ACCEPTED,
        CancelStatus::Removed => StatusCode::OK,
        CancelStatus::AlreadyCompleted => StatusCode::BAD_REQUEST,
        CancelStatus::NotFound => return Err(ApiError::not_found("UUID not found")),
    };

    Ok((status_code, Json(CancelResponse { status })))
}

async fn delete_job(
    State(state): State<AppState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    state
        .delete_job(query.uuid)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "status": "OK" })))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<QueueEntry>>, ApiError> {
    let jobs = state.list_queue().await.map_err(ApiError::internal)?;
    Ok(Json(jobs))
}

async fn job_image(
    State(state): State<AppState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let path = state
        .image_path(query.uuid)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("image not available, see /job/get"))?;
    let bytes = tokio::fs::read(&path).await.map_err(ApiError::internal)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.status().await.map_err(ApiError::internal)?;
    Ok(Json(status))
}

async fn gpu(State(state): State<AppState>) -> Json<Value> {
    Json(state.gpu().await)
}

async fn telegraf(State(state): State<AppState>) -> Result<String, ApiError> {
    state.telegraf_line().await.map_err(ApiError::internal)
}

fn ndjson(state: &AppState, id: Uuid) -> Response {
    let lines = state.stream(id).map(Ok::<_, Infallible>);
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal<T: Into<anyhow::Error>>(err: T) -> Self {
        let err = err.into();
        tracing::error!("{err:?}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".into(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
