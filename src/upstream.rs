use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

use crate::error::{GatewayError, UpstreamError};
use crate::models::{CompletionRequest, NormalizedResponse};
use crate::normalize::normalize;
use crate::routes::ModelRoute;

// upstream error bodies are logged, capped to this many bytes
const MAX_LOGGED_BODY: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct ForwarderTimeouts {
    pub connect: Duration,
    // idle time between body reads
    pub read: Duration,
    // whole exchange for non-streaming calls
    pub request: Duration,
}

impl Default for ForwarderTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(60),
            request: Duration::from_secs(120),
        }
    }
}

// Single-attempt forwarder; retry policy belongs to the caller
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    timeouts: ForwarderTimeouts,
}

impl Forwarder {
    pub fn new(timeouts: ForwarderTimeouts) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .build()
            .map_err(|e| GatewayError::Internal(format!("building http client: {e}")))?;
        Ok(Self { client, timeouts })
    }

    fn build(
        &self,
        route: &ModelRoute,
        request: &CompletionRequest,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(&route.url)
            .json(&request.upstream_body(&route.model, stream));
        match &route.api_key_header {
            Some(header) => builder.header(header.as_str(), &route.api_key),
            None => builder.header(AUTHORIZATION, format!("Bearer {}", route.api_key)),
        }
    }

    pub async fn forward(
        &self,
        route: &ModelRoute,
        request: &CompletionRequest,
    ) -> Result<NormalizedResponse, GatewayError> {
        let response = self
            .build(route, request, false)
            .timeout(self.timeouts.request)
            .send()
            .await
            .map_err(|e| log_failure(route, e.into()))?;
        let response = check_status(route, response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_json(&content_type) {
            return Err(log_failure(route, UpstreamError::NonJson { content_type }).into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| log_failure(route, e.into()))?;
        let body: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::error!(route = %route.id, error = %e, "upstream sent unparseable json");
            GatewayError::MalformedUpstream(format!("invalid json: {e}"))
        })?;

        normalize(body).inspect_err(|e| {
            tracing::error!(route = %route.id, error = %e, "upstream response has unexpected shape");
        })
    }

    /// Starts a streaming completion and hands back the response once the
    /// upstream headers arrive. Dropping it aborts the upstream connection.
    pub async fn open_stream(
        &self,
        route: &ModelRoute,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .build(route, request, true)
            .send()
            .await
            .map_err(|e| log_failure(route, e.into()))?;
        check_status(route, response).await
    }
}

// media type match ignores case and parameters
fn is_json(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.to_ascii_lowercase().contains("json")
}

async fn check_status(
    route: &ModelRoute,
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = UpstreamError::Status {
        status: status.as_u16(),
        body: redact(&body, &route.api_key),
    };
    Err(log_failure(route, err).into())
}

fn log_failure(route: &ModelRoute, err: UpstreamError) -> UpstreamError {
    crate::metrics::UPSTREAM_ERRORS.inc();
    match &err {
        UpstreamError::Status { status, body } => {
            tracing::error!(route = %route.id, status, body = %body, "upstream request failed");
        }
        other => tracing::error!(route = %route.id, error = %other, "upstream request failed"),
    }
    err
}

pub fn redact(body: &str, secret: &str) -> String {
    let mut body = if secret.is_empty() {
        body.to_string()
    } else {
        body.replace(secret, "[redacted]")
    };
    let mut end = body.len().min(MAX_LOGGED_BODY);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_strips_key_and_clips() {
        assert_eq!(redact("bad key sk-1 given", "sk-1"), "bad key [redacted] given");
        let long = "é".repeat(MAX_LOGGED_BODY);
        assert!(redact(&long, "sk").len() <= MAX_LOGGED_BODY);
    }

    #[test]
    fn json_content_type_ignores_case_and_params() {
        assert!(is_json("application/json"));
        assert!(is_json("Application/JSON; charset=utf-8"));
        assert!(is_json("application/vnd.api+json"));
        assert!(!is_json("text/html; note=json"));
        assert!(!is_json(""));
    }
}
