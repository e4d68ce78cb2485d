//! HTTP facade over a [`NodeHandle`].

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use memkv_common::error::MemkvError;
use memkv_common::types::NodeId;
use memkv_storage::{Envelope, NodeStatus};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::actor::NodeHandle;

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadParams {
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub ok: bool,
    pub existed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub key: String,
    pub value: String,
}

/// JSON body of every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub leader: Option<NodeId>,
}

/// A [`MemkvError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub MemkvError);

impl From<MemkvError> for ApiError {
    fn from(err: MemkvError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(MemkvError::InvalidArgument(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(MemkvError::InvalidArgument(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MemkvError::NotLeader { .. }
            | MemkvError::LeadershipLost
            | MemkvError::LeaderNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MemkvError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            MemkvError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            MemkvError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
        }

        let leader = match &self.0 {
            MemkvError::NotLeader { leader } => Some(*leader),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
            leader,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Routes of one node, wrapped in request tracing.
pub fn router(handle: NodeHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/raft/step", post(step))
        .route("/kv/write", post(write))
        .route("/kv/delete", post(delete))
        .route("/kv/read/:key", get(read))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

async fn status(State(node): State<NodeHandle>) -> ApiResult<NodeStatus> {
    Ok(Json(node.status().await?))
}

async fn step(
    State(node): State<NodeHandle>,
    body: Result<Json<Envelope>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(envelope) = body?;
    node.step(envelope).await?;
    Ok(StatusCode::OK)
}

async fn write(
    State(node): State<NodeHandle>,
    body: Result<Json<WriteRequest>, JsonRejection>,
) -> ApiResult<WriteResponse> {
    let Json(req) = body?;
    node.write(req.key, req.value).await?;
    Ok(Json(WriteResponse { ok: true }))
}

async fn delete(
    State(node): State<NodeHandle>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<DeleteResponse> {
    let Json(req) = body?;
    let existed = node.delete(req.key).await?;
    Ok(Json(DeleteResponse { ok: true, existed }))
}

async fn read(
    State(node): State<NodeHandle>,
    Path(key): Path<String>,
    params: Result<Query<ReadParams>, QueryRejection>,
) -> ApiResult<ReadResponse> {
    let Query(params) = params?;
    let value = node.read(key.clone(), params.stale).await?;
    Ok(Json(ReadResponse { key, value }))
}
