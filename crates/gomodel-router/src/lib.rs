pub mod context;
pub mod handlers;
pub mod middleware;
pub mod respond;
pub mod scan;
pub mod stream_log;
pub mod stream_usage;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};

pub use context::AppState;

/// The public API surface. Middleware runs outermost-first: request-id,
/// panic recovery, body-size limit, master-key auth, audit context, model
/// validation, then the handler.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/embeddings", post(handlers::embeddings))
        .layer(from_fn_with_state(state.clone(), middleware::validate_model))
        .layer(from_fn_with_state(state.clone(), middleware::audit_context))
        .layer(from_fn_with_state(state.clone(), middleware::master_key_auth))
        .layer(from_fn_with_state(state.clone(), middleware::body_limit))
        .layer(from_fn(middleware::recover))
        .layer(from_fn(middleware::request_id))
        .with_state(state)
}
