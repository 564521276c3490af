//! Authenticated, rate-limited gateway in front of OpenAI-style chat
//! completion backends.
//!
//! Each `POST /proxy/{model_id}` is authenticated against a shared secret,
//! charged against a sliding-window rate limit, resolved to an upstream
//! route, forwarded, and reshaped so that clients always find the reply
//! text in a top-level `text` field (or as `data:` deltas when streaming).

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod rate_limit;
pub mod routes;
pub mod sse;
pub mod state;
pub mod upstream;
pub mod worker;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use error::{GatewayError, UpstreamError};
pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/proxy/{model_id}", post(handlers::completion_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
