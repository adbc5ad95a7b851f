//! HTTP handlers for the Tidemark API

use axum::{
    extract::{Multipart, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::disclaimer;
use crate::error::ApiError;
use crate::models::WatermarkRequest;
use crate::state::AppState;

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Watermark an uploaded PDF for the requesting tenant.
///
/// The tenant is resolved before anything is fetched or counted, so an
/// unknown email never touches the asset store or the ledger.
pub async fn watermark(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    authorize(&headers, &state.api_key)?;

    let request = WatermarkRequest::from_multipart(multipart).await?;

    let tenant = state
        .tenants
        .get_by_email(&request.email)
        .await?
        .ok_or_else(|| ApiError::UnknownTenant(request.email.clone()))?;

    // Computed up front: the pipeline takes ownership of the document.
    let delivery_filename = request.delivery_filename();

    let result = state
        .pipeline
        .run(&tenant, &request.parties, request.document)
        .await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pdf"),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            delivery_filename
        ))
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid filename: {}", e)))?,
    );

    if let Some(notice) = request.state.as_deref().and_then(disclaimer::for_state) {
        response_headers.insert("X-State-Disclaimer", HeaderValue::from_static(notice));
    }

    if let Some(usage) = result.usage {
        if let Ok(value) = HeaderValue::from_str(&usage.lifetime.to_string()) {
            response_headers.insert("X-Pages-Used", value);
        }
    }

    Ok((response_headers, result.bytes).into_response())
}

/// Constant shared-secret check against the `Authorization: Bearer` header.
fn authorize(headers: &HeaderMap, api_key: &str) -> Result<(), ApiError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(key) if key == api_key => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}
