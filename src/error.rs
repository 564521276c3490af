use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::rate_limit::RateDecision;

// Failures talking to the upstream completion API
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },
    #[error("upstream returned non-json content type {content_type:?}")]
    NonJson { content_type: String },
    #[error("upstream request timed out")]
    Timeout,
    #[error("could not connect to upstream: {0}")]
    Connect(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        // the url may carry credentials in its query string
        let err = err.without_url();
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_connect() {
            UpstreamError::Connect(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

// Which budget rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Client,
    Model,
}

impl RateScope {
    pub fn header_suffix(self) -> &'static str {
        match self {
            RateScope::Client => "",
            RateScope::Model => "-model",
        }
    }
}

impl std::fmt::Display for RateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateScope::Client => f.write_str("client"),
            RateScope::Model => f.write_str("model"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("no model route found for {0:?}")]
    NotFound(String),
    #[error("rate limit exceeded for {scope}")]
    RateLimited {
        scope: RateScope,
        decision: RateDecision,
        // the client budget's decision when another budget rejected
        client: Option<RateDecision>,
    },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("malformed upstream response: {0}")]
    MalformedUpstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_)
            | GatewayError::MalformedUpstream(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller. Auth failures never say which
    /// check failed and upstream details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Auth(_) => "Invalid or missing API key".to_string(),
            GatewayError::Validation(reason) => reason.clone(),
            GatewayError::NotFound(id) => format!("No model {id} found"),
            GatewayError::RateLimited { scope, decision, .. } => format!(
                "Rate limit exceeded for {scope}. Retry in {} seconds.",
                decision.reset_seconds
            ),
            GatewayError::Upstream(UpstreamError::Status { status, .. }) => {
                format!("Upstream request failed with status {status}")
            }
            GatewayError::Upstream(UpstreamError::Timeout) => {
                "Upstream request timed out".to_string()
            }
            GatewayError::Upstream(_) => "Upstream request failed".to_string(),
            GatewayError::MalformedUpstream(_) => {
                "Upstream returned an unexpected response".to_string()
            }
            GatewayError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

pub fn rate_limit_headers(headers: &mut HeaderMap, decision: &RateDecision, suffix: &str) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit as u64),
        ("x-ratelimit-remaining", decision.remaining as u64),
        ("x-ratelimit-reset", decision.reset_seconds),
    ];
    for (name, value) in pairs {
        if let Ok(name) = format!("{name}{suffix}").parse::<axum::http::HeaderName>() {
            headers.insert(name, HeaderValue::from(value));
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.client_message();

        match &self {
            GatewayError::RateLimited {
                scope,
                decision,
                client,
            } => {
                let body = json!({
                    "error": message,
                    "limit": decision.limit,
                    "remaining": decision.remaining,
                    "reset": decision.reset_seconds,
                });
                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                if let Some(client) = client {
                    rate_limit_headers(headers, client, RateScope::Client.header_suffix());
                }
                rate_limit_headers(headers, decision, scope.header_suffix());
                headers.insert("retry-after", HeaderValue::from(decision.reset_seconds));
                response
            }
            _ => (status, Json(json!({ "error": message }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_message_hides_body() {
        let err = GatewayError::Upstream(UpstreamError::Status {
            status: 503,
            body: "bad key sk-secret".to_string(),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.client_message().contains("sk-secret"));
    }

    #[test]
    fn auth_errors_share_one_message() {
        let a = GatewayError::Auth(AuthError::Unconfigured).client_message();
        let b = GatewayError::Auth(AuthError::Invalid).client_message();
        let c = GatewayError::Auth(AuthError::Missing).client_message();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let err = GatewayError::RateLimited {
            scope: RateScope::Client,
            decision: RateDecision {
                allowed: false,
                limit: 12,
                remaining: 0,
                reset_seconds: 3600,
                blocked_until: Some(3_601_000),
            },
            client: None,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "3600");
        assert_eq!(response.headers()["x-ratelimit-limit"], "12");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn model_rejection_keeps_client_headers_unsuffixed() {
        let err = GatewayError::RateLimited {
            scope: RateScope::Model,
            decision: RateDecision {
                allowed: false,
                limit: 1,
                remaining: 0,
                reset_seconds: 60,
                blocked_until: Some(60_000),
            },
            client: Some(RateDecision {
                allowed: true,
                limit: 12,
                remaining: 11,
                reset_seconds: 60,
                blocked_until: None,
            }),
        };
        let response = err.into_response();
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "12");
        assert_eq!(headers["x-ratelimit-remaining"], "11");
        assert_eq!(headers["x-ratelimit-limit-model"], "1");
        assert_eq!(headers["x-ratelimit-remaining-model"], "0");
        assert_eq!(headers["retry-after"], "60");
    }
}
