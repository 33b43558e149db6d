use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use futures_util::FutureExt;
use serde_json::Value;

use gomodel_common::{CapturedBody, GatewayError, api_key_hash, decompress_body, redact_headers};
use gomodel_storage::AuditLogEntry;

use crate::context::{AppState, AuditHandle, BufferedBody, ProviderType, RequestId, StreamingMarker};
use crate::respond::{error_response_parts, fail};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Paths that go through model validation; everything else skips it.
const MODEL_PATHS: &[&str] = &["/v1/chat/completions", "/v1/responses", "/v1/embeddings"];

pub fn is_model_path(path: &str) -> bool {
    MODEL_PATHS.contains(&path)
}

/// Honor an inbound `X-Request-ID`, otherwise mint one; either way echo it on
/// the response and propagate it on the request context.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let rid = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(rid.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// A panicking handler becomes a 500, not a dropped connection.
pub async fn recover(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("request handler panicked");
            error_response_parts(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal server error",
            )
        }
    }
}

/// Buffer the request body once, under the configured cap. Applies to every
/// method; an over-limit body is rejected before any handler work.
pub async fn body_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, state.body_limit_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response_parts(
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "request body too large",
            );
        }
    };

    let mut req = Request::from_parts(parts, Body::from(bytes.clone()));
    req.extensions_mut().insert(BufferedBody(bytes));
    next.run(req).await
}

/// Uniform bearer check against the master key. `/health` and `/metrics`
/// stay public; the rejection body never says why.
pub async fn master_key_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return next.run(req).await;
    }
    let Some(master_key) = &state.master_key else {
        return next.run(req).await;
    };

    let authorized = bearer_token(req.headers())
        .map(|token| token == master_key)
        .unwrap_or(false);
    if !authorized {
        return error_response_parts(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "invalid or missing api key",
        );
    }
    next.run(req).await
}

/// Open a preliminary audit entry, attach it to the request, and complete it
/// after the handler — unless the handler marked the response as streaming,
/// in which case the stream wrapper owns the write.
pub async fn audit_context(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(audit_logger) = state.audit.clone() else {
        return next.run(req).await;
    };
    let path = req.uri().path().to_string();
    if state.only_model_interactions && !is_model_path(&path) {
        return next.run(req).await;
    }

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default();
    let mut entry = AuditLogEntry::begin(request_id, req.method().as_str(), &path);
    entry.client_ip = client_ip(&req);
    entry.payload.user_agent = header_value(req.headers(), header::USER_AGENT.as_str());
    entry.payload.api_key_hash = bearer_token(req.headers()).map(api_key_hash);

    if state.log_headers {
        entry.payload.headers = Some(redacted_header_map(req.headers()));
    }
    if state.log_bodies
        && let Some(BufferedBody(bytes)) = req.extensions().get::<BufferedBody>()
        && !bytes.is_empty()
    {
        let captured = CapturedBody::capture(bytes);
        entry.payload.request_body = Some(captured.value);
        entry.payload.request_body_too_big_to_handle = captured.truncated;
    }

    let handle = AuditHandle::new(entry);
    let mut req = req;
    req.extensions_mut().insert(handle.clone());

    let response = next.run(req).await;

    if response.extensions().get::<StreamingMarker>().is_some() {
        return response;
    }

    handle.update(|entry| {
        entry.status_code = Some(response.status().as_u16() as i32);
        entry.finish_duration();
    });

    let response = if state.log_bodies {
        capture_response_body(&handle, response).await
    } else {
        response
    };

    audit_logger.write(handle.snapshot());
    response
}

/// Read and rewind the JSON body, resolve the model early, and put the
/// provider type on the context for the handler and the usage record.
pub async fn validate_model(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !is_model_path(req.uri().path()) {
        return next.run(req).await;
    }

    let audit = req.extensions().get::<AuditHandle>().cloned();
    let model = req
        .extensions()
        .get::<BufferedBody>()
        .and_then(|BufferedBody(bytes)| serde_json::from_slice::<Value>(bytes).ok())
        .and_then(|value| {
            value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|model| !model.is_empty());

    let Some(model) = model else {
        return fail(
            audit.as_ref(),
            GatewayError::invalid_request("missing required field: model"),
        );
    };
    if !state.router.supports(&model) {
        return fail(
            audit.as_ref(),
            GatewayError::invalid_request(format!("unsupported model: {model}")),
        );
    }

    let provider_type = state.router.provider_type(&model).unwrap_or_default();
    if let Some(audit) = &audit {
        audit.update(|entry| {
            entry.model = Some(model.clone());
            entry.provider = Some(provider_type.clone());
        });
    }

    let mut req = req;
    req.extensions_mut().insert(ProviderType(provider_type));
    next.run(req).await
}

async fn capture_response_body(handle: &AuditHandle, response: Response) -> Response {
    let (parts, body) = response.into_parts();
    match to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            let encoding = parts
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok());
            let inflated = decompress_body(encoding, &bytes);
            let captured = CapturedBody::capture(&inflated);
            handle.update(|entry| {
                entry.payload.response_body = Some(captured.value);
                entry.payload.response_body_too_big_to_handle = captured.truncated;
            });
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(err) => {
            tracing::warn!(%err, "response body capture failed");
            Response::from_parts(parts, Body::empty())
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn redacted_header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    redact_headers(&pairs).into_iter().collect()
}

fn client_ip(req: &Request) -> Option<String> {
    if let Some(forwarded) = header_value(req.headers(), "x-forwarded-for") {
        let first = forwarded.split(',').next().map(str::trim).unwrap_or("");
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}
