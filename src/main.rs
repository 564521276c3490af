use anyhow::Context;
use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use completion_gateway::config::Args;
use completion_gateway::rate_limit::{RateLimitStore, SlidingWindowLimiter, sweeper};
use completion_gateway::routes::InMemoryRouteStore;
use completion_gateway::upstream::Forwarder;
use completion_gateway::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "completion_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();

    let routes = match &args.routes_file {
        Some(path) => InMemoryRouteStore::load(path)
            .with_context(|| format!("loading routes from {}", path.display()))?,
        None => InMemoryRouteStore::new(),
    };
    if routes.is_empty() {
        tracing::warn!("no model routes configured, every proxy request will 404");
    }
    if args.api_key.is_none() {
        tracing::error!("PROXY_API_KEY is not set, proxy requests will be rejected");
    }

    let client_limiter: Arc<dyn RateLimitStore> =
        Arc::new(SlidingWindowLimiter::new(args.client_policy()));
    let model_limiter = args
        .model_policy()
        .map(|policy| Arc::new(SlidingWindowLimiter::new(policy)) as Arc<dyn RateLimitStore>);

    // creating shared state
    let state = Arc::new(AppState {
        forwarder: Forwarder::new(args.timeouts())?,
        routes: Arc::new(routes),
        client_limiter,
        model_limiter,
        api_key: args.api_key.clone(),
        max_body_bytes: args.max_body_bytes,
    });

    // spawn the background sweeper
    let limiters = state.limiters();
    let sweep_every = Duration::from_secs(args.sweep_interval.max(1));
    tokio::spawn(async move {
        sweeper(limiters, sweep_every).await;
    });

    let app = router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(%addr, "gateway listening");
    tracing::info!(
        limit = args.rate_limit,
        window_secs = args.rate_window,
        block_secs = args.rate_block,
        model_limit = ?args.model_rate_limit,
        "rate limiting enabled"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
