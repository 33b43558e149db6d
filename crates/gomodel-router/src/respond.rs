use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use gomodel_common::GatewayError;

use crate::context::AuditHandle;

/// Map a typed gateway error to the OpenAI-style error body plus its status.
pub fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_body())).into_response()
}

/// Error response with a free-standing status/type pair (for cases that have
/// no `GatewayError`, like the body-size limit).
pub fn error_response_parts(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"type": error_type, "message": message}})),
    )
        .into_response()
}

/// Record the failure on the audit entry, then respond with it.
pub fn fail(audit: Option<&AuditHandle>, err: GatewayError) -> Response {
    if let Some(audit) = audit {
        audit.update(|entry| {
            entry.error_type = Some(err.error_type().to_string());
            entry.payload.error_message = Some(err.message.clone());
        });
    }
    error_response(&err)
}
