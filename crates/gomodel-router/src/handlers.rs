use axum::Json;
use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use gomodel_client::ByteStream;
use gomodel_common::GatewayError;
use gomodel_protocol::chat::ChatCompletionRequest;
use gomodel_protocol::embeddings::EmbeddingsRequest;
use gomodel_protocol::responses::ResponsesRequest;
use gomodel_storage::UsageEntry;

use crate::context::{AppState, AuditHandle, BufferedBody, ProviderType, RequestId, StreamingMarker};
use crate::respond::fail;
use crate::scan::StreamKind;
use crate::stream_log::AuditStream;
use crate::stream_usage::{UsageMeta, UsageStream};

pub async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    Json(state.router.list_models()).into_response()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    audit: Option<Extension<AuditHandle>>,
    provider_type: Option<Extension<ProviderType>>,
    Extension(BufferedBody(bytes)): Extension<BufferedBody>,
) -> Response {
    let audit = audit.map(|Extension(handle)| handle);
    let provider = provider_type
        .map(|Extension(ProviderType(provider))| provider)
        .unwrap_or_default();

    let request: ChatCompletionRequest = match decode(&bytes) {
        Ok(request) => request,
        Err(err) => return fail(audit.as_ref(), err),
    };
    let model = request.model.clone();

    if !request.is_stream() {
        return match state.router.chat(request).await {
            Ok(response) => {
                if let Some(usage) = &response.usage {
                    record_usage(
                        &state,
                        audit.as_ref(),
                        UsageEntry::new(
                            request_id.0,
                            response.id.clone(),
                            response.model.clone(),
                            provider,
                            "chat",
                        )
                        .with_tokens(
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            usage.total_tokens,
                        ),
                    );
                }
                Json(response).into_response()
            }
            Err(err) => fail(audit.as_ref(), err),
        };
    }

    match state.router.chat_stream(request).await {
        Ok(upstream) => stream_response(
            &state,
            StreamKind::Chat,
            upstream,
            audit,
            UsageMeta {
                request_id: request_id.0,
                model,
                provider,
                endpoint: "chat".to_string(),
            },
        ),
        Err(err) => fail(audit.as_ref(), err),
    }
}

pub async fn responses(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    audit: Option<Extension<AuditHandle>>,
    provider_type: Option<Extension<ProviderType>>,
    Extension(BufferedBody(bytes)): Extension<BufferedBody>,
) -> Response {
    let audit = audit.map(|Extension(handle)| handle);
    let provider = provider_type
        .map(|Extension(ProviderType(provider))| provider)
        .unwrap_or_default();

    let request: ResponsesRequest = match decode(&bytes) {
        Ok(request) => request,
        Err(err) => return fail(audit.as_ref(), err),
    };
    let model = request.model.clone();

    if !request.is_stream() {
        return match state.router.responses(request).await {
            Ok(response) => {
                if let Some(usage) = &response.usage {
                    record_usage(
                        &state,
                        audit.as_ref(),
                        UsageEntry::new(
                            request_id.0,
                            response.id.clone(),
                            response.model.clone(),
                            provider,
                            "responses",
                        )
                        .with_tokens(usage.input_tokens, usage.output_tokens, usage.total_tokens),
                    );
                }
                Json(response).into_response()
            }
            Err(err) => fail(audit.as_ref(), err),
        };
    }

    match state.router.responses_stream(request).await {
        Ok(upstream) => stream_response(
            &state,
            StreamKind::Responses,
            upstream,
            audit,
            UsageMeta {
                request_id: request_id.0,
                model,
                provider,
                endpoint: "responses".to_string(),
            },
        ),
        Err(err) => fail(audit.as_ref(), err),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    audit: Option<Extension<AuditHandle>>,
    provider_type: Option<Extension<ProviderType>>,
    Extension(BufferedBody(bytes)): Extension<BufferedBody>,
) -> Response {
    let audit = audit.map(|Extension(handle)| handle);
    let provider = provider_type
        .map(|Extension(ProviderType(provider))| provider)
        .unwrap_or_default();

    let request: EmbeddingsRequest = match decode(&bytes) {
        Ok(request) => request,
        Err(err) => return fail(audit.as_ref(), err),
    };

    match state.router.embeddings(request).await {
        Ok(response) => {
            if let Some(usage) = &response.usage {
                record_usage(
                    &state,
                    audit.as_ref(),
                    UsageEntry::new(
                        request_id.0,
                        String::new(),
                        response.model.clone(),
                        provider,
                        "embeddings",
                    )
                    .with_tokens(usage.prompt_tokens, 0, usage.total_tokens),
                );
            }
            Json(response).into_response()
        }
        Err(err) => fail(audit.as_ref(), err),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(bytes)
        .map_err(|err| GatewayError::invalid_request(format!("invalid request body: {err}")))
}

/// Feed the usage logger and mirror the token counts onto the audit entry.
fn record_usage(state: &AppState, audit: Option<&AuditHandle>, entry: UsageEntry) {
    if let Some(audit) = audit {
        audit.update(|audit_entry| {
            audit_entry.prompt_tokens = Some(entry.input_tokens);
            audit_entry.completion_tokens = Some(entry.output_tokens);
            audit_entry.total_tokens = Some(entry.total_tokens);
        });
    }
    if let Some(usage_logger) = &state.usage {
        usage_logger.write(entry);
    }
}

/// SSE proxy: wrap the upstream body with the audit stream wrapper and the
/// usage wrapper, mark the response streaming so the middleware stands down,
/// and hand the bytes to the client as they arrive.
fn stream_response(
    state: &AppState,
    kind: StreamKind,
    upstream: ByteStream,
    audit: Option<AuditHandle>,
    meta: UsageMeta,
) -> Response {
    let audited = audit.zip(state.audit.clone());
    let body = match (audited, state.usage.clone()) {
        (Some((handle, logger)), Some(usage_logger)) => Body::from_stream(UsageStream::new(
            AuditStream::new(upstream, kind, handle, logger, state.log_bodies),
            kind,
            meta,
            usage_logger,
        )),
        (Some((handle, logger)), None) => Body::from_stream(AuditStream::new(
            upstream,
            kind,
            handle,
            logger,
            state.log_bodies,
        )),
        (None, Some(usage_logger)) => Body::from_stream(UsageStream::new(
            ReceiverStream::new(upstream),
            kind,
            meta,
            usage_logger,
        )),
        (None, None) => Body::from_stream(ReceiverStream::new(upstream)),
    };

    let mut response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response();
    response.extensions_mut().insert(StreamingMarker);
    response
}
