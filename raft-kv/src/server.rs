//! HTTP surface of a node.
//!
//! One router serves both audiences:
//! - clients: `GET|PUT|POST|DELETE /kv/:key` and `GET /status`
//! - peers: the two Raft RPCs, as JSON, on the paths [`HttpPeerSender`]
//!   posts to
//!
//! [`HttpPeerSender`]: crate::transport::HttpPeerSender

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::command::Command;
use crate::error::RaftError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::node::{Node, NodeStatus};
use crate::transport::RpcHandler;
use crate::transport::http::{APPEND_ENTRIES_PATH, REQUEST_VOTE_PATH};

#[derive(Clone)]
struct AppState {
    node: Node,
    rpc: Arc<dyn RpcHandler>,
}

/// Builds the router for `node`.
pub fn router(node: Node) -> Router {
    let rpc = node.rpc_handler();
    Router::new()
        .route(
            "/kv/:key",
            get(get_key).put(set_key).post(set_key).delete(delete_key),
        )
        .route("/status", get(status))
        .route(REQUEST_VOTE_PATH, post(request_vote))
        .route(APPEND_ENTRIES_PATH, post(append_entries))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { node, rpc })
}

#[derive(Debug, Deserialize)]
pub struct SetBody {
    pub value: String,
}

#[derive(Debug, Serialize)]
struct KeyValue {
    key: String,
    value: Option<String>,
    previous: Option<String>,
}

/// Maps node errors onto the client API's status codes.
pub struct ApiError(RaftError);

impl From<RaftError> for ApiError {
    fn from(err: RaftError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self.0 {
            RaftError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RaftError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RaftError::Storage(_) | RaftError::Stopped => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self.0 {
            RaftError::NotLeader { leader_id } => {
                json!({ "error": "not leader", "leader_id": leader_id })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

async fn get_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    match state.node.read(&key).await? {
        Some(value) => Ok(Json(KeyValue {
            key,
            value: Some(value),
            previous: None,
        })
        .into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "key not found", "key": key })),
        )
            .into_response()),
    }
}

async fn set_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<SetBody>,
) -> Result<Json<KeyValue>, ApiError> {
    debug!(key = %key, "set");
    let output = state
        .node
        .submit(Command::set(key.clone(), body.value.clone()))
        .await?;
    Ok(Json(KeyValue {
        key,
        value: Some(body.value),
        previous: output.previous,
    }))
}

async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<KeyValue>, ApiError> {
    debug!(key = %key, "delete");
    let output = state.node.submit(Command::delete(key.clone())).await?;
    Ok(Json(KeyValue {
        key,
        value: None,
        previous: output.previous,
    }))
}

async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.node.status())
}

async fn request_vote(
    State(state): State<AppState>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    Json(state.rpc.handle_request_vote(request))
}

async fn append_entries(
    State(state): State<AppState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(state.rpc.handle_append_entries(request))
}
