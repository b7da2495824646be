use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("conflict: node {0} already exists")]
    DuplicateNode(String),
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("cannot delete node {node_id}: it still holds {chunk_count} chunks; retry with force=true to accept data loss")]
    NodeNotEmpty { node_id: String, chunk_count: u64 },
    #[error("insufficient capacity: {available} of {requested} requested replicas available")]
    InsufficientCapacity { requested: usize, available: usize },
    #[error("placement {0} not found")]
    PlacementNotFound(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("used bytes {used} exceed capacity {capacity}")]
    UsageExceedsCapacity { used: u64, capacity: u64 },
    #[error("start failed: {0}")]
    StartFailure(String),
    #[error("stop failed: {0}")]
    StopFailure(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = match self {
            ApiError::DuplicateNode(_) => StatusCode::CONFLICT,
            ApiError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NodeNotEmpty { .. } => StatusCode::CONFLICT,
            ApiError::InsufficientCapacity { .. } => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::PlacementNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ApiError::UsageExceedsCapacity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::StartFailure(_) => StatusCode::BAD_GATEWAY,
            ApiError::StopFailure(_) => StatusCode::BAD_GATEWAY,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Any(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status_code, self.to_string()).into_response()
    }
}
