//! Standalone single-target proxy server.
//!
//! Wraps the library's forwarding engine in an Axum front server: every
//! inbound request, any method and path, is forwarded to one fixed backend.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use onehop::{Forwarder, ProxyBody, SingleHostConfig};

#[derive(Parser)]
#[command(name = "onehop")]
#[command(about = "Forward all inbound HTTP traffic to one backend", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Backend URL, e.g. http://localhost:3000
    #[arg(short, long)]
    target: String,

    /// Path rewrite rule, PATTERN=REPLACEMENT; repeatable, first match wins
    #[arg(short, long = "rewrite", value_name = "PATTERN=REPLACEMENT")]
    rewrites: Vec<String>,

    /// Rewrite Host and Origin to the target
    #[arg(long)]
    change_origin: bool,

    /// Do not inject X-Forwarded-* headers
    #[arg(long)]
    anonymous: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onehop=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut rewrites = Vec::new();
    for rule in &cli.rewrites {
        let (pattern, replacement) = rule
            .split_once('=')
            .ok_or_else(|| format!("rewrite rule {rule:?} is not PATTERN=REPLACEMENT"))?;
        rewrites.push((pattern.to_string(), replacement.to_string()));
    }

    let forwarder = Arc::new(Forwarder::single_host(
        &cli.target,
        SingleHostConfig {
            rewrites,
            change_origin: cli.change_origin,
            anonymous: cli.anonymous,
            ..Default::default()
        },
    )?);

    let app = Router::new()
        .route("/", any(handler))
        .route("/{*path}", any(handler))
        .layer(TraceLayer::new_for_http())
        .with_state(forwarder);

    let listener = TcpListener::bind(&cli.listen).await?;
    tracing::info!(
        listen = %listener.local_addr()?,
        target = %cli.target,
        "proxy started"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn handler(
    State(forwarder): State<Arc<Forwarder>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response<ProxyBody> {
    forwarder.forward(request, peer).await
}
