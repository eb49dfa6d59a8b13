use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::raft::RaftNode;
use crate::rpc::{
    AppendEntriesReply, AppendEntriesRequest, StatusReply, SubmitReply, SubmitRequest, VoteReply,
    VoteRequest,
};

/// Builds the node's HTTP surface: the two peer RPCs, the client-facing
/// submit endpoint, and diagnostics. Malformed bodies are answered 4xx by
/// the JSON extractor before any handler runs.
pub fn router(node: Arc<RaftNode>) -> Router {
    Router::new()
        .route("/request_vote", post(request_vote))
        .route("/append_entries", post(append_entries))
        .route("/submit", post(submit))
        .route("/status", get(status))
        .route("/health", get(|| async { "OK" }))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(node)
}

async fn request_vote(
    State(node): State<Arc<RaftNode>>,
    Json(request): Json<VoteRequest>,
) -> Json<VoteReply> {
    Json(node.handle_request_vote(request).await)
}

async fn append_entries(
    State(node): State<Arc<RaftNode>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesReply> {
    Json(node.handle_append_entries(request).await)
}

async fn submit(
    State(node): State<Arc<RaftNode>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitReply>, ApiError> {
    let index = node.submit(request.command).await?;
    Ok(Json(SubmitReply {
        success: true,
        index,
    }))
}

async fn status(State(node): State<Arc<RaftNode>>) -> Json<StatusReply> {
    Json(node.status().await)
}
