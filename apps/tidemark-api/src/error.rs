//! Error types for the Tidemark API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tidemark_core::PipelineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::UnknownTenant(email) => (
                StatusCode::UNAUTHORIZED,
                format!("Unknown tenant: {}", email),
            ),
            ApiError::Pipeline(err) => pipeline_status(err),
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Map stage failures onto the HTTP surface. Missing brand assets are the
/// tenant's fixable problem; undecipherable or malformed documents are the
/// upload's problem; everything else is on us.
fn pipeline_status(err: &PipelineError) -> (StatusCode, String) {
    match err {
        PipelineError::AssetNotFound { tenant } => (
            StatusCode::NOT_FOUND,
            format!("No brand asset found for {}", tenant),
        ),
        PipelineError::DecryptFailure(msg) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Document could not be decrypted: {}", msg),
        ),
        PipelineError::Composition(msg) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Document could not be processed: {}", msg),
        ),
        PipelineError::DecryptTimeout { secs } => (
            StatusCode::GATEWAY_TIMEOUT,
            format!("Decryption timed out after {}s", secs),
        ),
        other => {
            tracing::error!("Pipeline error: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
        }
    }
}
