use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to HTTP clients as a JSON envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The node is not the leader; the client should try another node.
    #[error("Not leader")]
    NotLeader,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotLeader => StatusCode::BAD_REQUEST,
        };
        let body = Json(json!({
            "success": false,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
