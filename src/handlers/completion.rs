use axum::{
    Json,
    extract::{ConnectInfo, Path, Request, State},
    http::HeaderValue,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::{self, AuthError};
use crate::error::{GatewayError, RateScope, rate_limit_headers};
use crate::identity::client_identity;
use crate::metrics::{AUTH_FAILURES, RATE_LIMITED, REQUEST_LATENCY, REQUEST_TOTAL, RESPONSES};
use crate::models::CompletionRequest;
use crate::rate_limit::RateDecision;
use crate::routes::ModelRoute;
use crate::state::AppState;
use crate::worker::{StreamEvent, stream_worker};

// chunks buffered between the upstream reader and a slow client
const STREAM_BUFFER: usize = 32;

pub async fn completion_handler(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    request: Request,
) -> Response {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();

    let response = match proxy(&state, &model_id, request).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                GatewayError::Upstream(_)
                | GatewayError::MalformedUpstream(_)
                | GatewayError::Internal(_) => {
                    tracing::error!(%model_id, error = %err, "proxy request failed")
                }
                _ => tracing::debug!(%model_id, error = %err, "proxy request rejected"),
            }
            err.into_response()
        }
    };

    RESPONSES
        .with_label_values(&[response.status().as_str()])
        .inc();
    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());
    response
}

// authenticate -> rate limit -> parse -> resolve route -> forward
async fn proxy(
    state: &AppState,
    model_id: &str,
    request: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();

    // the limiter only ever sees authenticated requests
    if let Err(err) = auth::validate(&parts.headers, state.api_key.as_deref()) {
        AUTH_FAILURES.inc();
        if err == AuthError::Unconfigured {
            tracing::error!("PROXY_API_KEY is not set, rejecting proxy request");
        }
        return Err(err.into());
    }

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(&parts.headers, peer);
    let (client_decision, model_decision) = check_limits(state, &client, model_id)?;

    let bytes = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| GatewayError::Validation("Request body is unreadable or too large".to_string()))?;
    let request = CompletionRequest::parse(&bytes)?;

    let route = state
        .routes
        .resolve(model_id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(model_id.to_string()))?;
    tracing::info!(model_id, %client, stream = request.is_stream(), "forwarding completion");

    let mut response = if request.is_stream() {
        stream_response(state, &route, &request).await?
    } else {
        Json(state.forwarder.forward(&route, &request).await?).into_response()
    };

    let headers = response.headers_mut();
    rate_limit_headers(headers, &client_decision, RateScope::Client.header_suffix());
    if let Some(decision) = &model_decision {
        rate_limit_headers(headers, decision, RateScope::Model.header_suffix());
    }
    Ok(response)
}

fn check_limits(
    state: &AppState,
    client: &str,
    model_id: &str,
) -> Result<(RateDecision, Option<RateDecision>), GatewayError> {
    let client_decision = state.client_limiter.check(&format!("ip:{client}"));
    if !client_decision.allowed {
        RATE_LIMITED.inc();
        return Err(GatewayError::RateLimited {
            scope: RateScope::Client,
            decision: client_decision,
            client: None,
        });
    }

    let Some(limiter) = &state.model_limiter else {
        return Ok((client_decision, None));
    };
    let model_decision = limiter.check(&format!("model:{model_id}"));
    if !model_decision.allowed {
        RATE_LIMITED.inc();
        return Err(GatewayError::RateLimited {
            scope: RateScope::Model,
            decision: model_decision,
            client: Some(client_decision),
        });
    }
    Ok((client_decision, Some(model_decision)))
}

async fn stream_response(
    state: &AppState,
    route: &ModelRoute,
    request: &CompletionRequest,
) -> Result<Response, GatewayError> {
    let upstream = state.forwarder.open_stream(route, request).await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let route_id = route.id.clone();
    tokio::spawn(async move {
        let end = stream_worker(upstream.bytes_stream(), tx).await;
        tracing::debug!(route = %route_id, ?end, "stream closed");
    });

    let events = ReceiverStream::new(rx).map(sse_event);
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

fn sse_event(event: StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Chunk(chunk) => Event::default().json_data(chunk),
        StreamEvent::Error(message) => Ok(Event::default()
            .event("error")
            .data(json!({ "error": message }).to_string())),
        StreamEvent::Done => Ok(Event::default().data("[DONE]")),
    }
}
