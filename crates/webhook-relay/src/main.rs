//! Webhook Relay Server
//!
//! Fans provider webhooks out to websocket subscribers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use webhook_relay::config::{IngressResponse, RelayConfig};
use webhook_relay::fanout::{OverflowPolicy, RelayMode};
use webhook_relay::server::{AppState, create_router};

/// Webhook-to-WebSocket Relay
#[derive(Parser, Debug)]
#[command(name = "webhook-relay")]
#[command(about = "Relay provider webhooks to websocket subscribers", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Server host address
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// How client-sent messages are relayed
    #[arg(long, value_enum)]
    relay_mode: Option<RelayMode>,

    /// What to do when a subscriber falls behind
    #[arg(long, value_enum)]
    overflow_policy: Option<OverflowPolicy>,

    /// Ingress response body
    #[arg(long, value_enum)]
    ingress_response: Option<IngressResponse>,

    /// Reject non-JSON event bodies
    #[arg(long)]
    require_json: bool,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration
    fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.relay_mode {
            config.relay_mode = mode;
        }
        if let Some(policy) = self.overflow_policy {
            config.overflow_policy = policy;
        }
        if let Some(response) = self.ingress_response {
            config.ingress_response = response;
        }
        config.require_json |= self.require_json;
        config.log_json |= self.log_json;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = args.apply(RelayConfig::load(&args.config)?);

    init_tracing(config.log_json);

    info!("Starting webhook-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        relay_mode = %config.relay_mode,
        overflow_policy = %config.overflow_policy,
        queue_capacity = config.queue_capacity,
        "Relay configured"
    );

    // Create application state and the dispatch task
    let (state, dispatch_task) = AppState::new(config.clone());

    // Create router
    let app = create_router(state.clone());

    // Start server
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    // Upgrades that completed while the listener was draining
    let late = state.close_all_sessions();
    if late > 0 {
        info!("Closing {} late subscriber sessions", late);
    }

    // The dispatcher exits once the last state clone is gone, i.e. after
    // every session has torn down
    drop(state);
    match tokio::time::timeout(config.shutdown_timeout(), dispatch_task).await {
        Ok(Ok(())) => info!("Server shutdown complete"),
        Ok(Err(e)) => warn!("Dispatcher task failed: {}", e),
        Err(_) => warn!("Sessions did not drain within {:?}", config.shutdown_timeout()),
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("webhook_relay=info,tower_http=debug"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal, then close every subscriber
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    let closed = state.close_all_sessions();
    info!("Closing {} subscriber sessions", closed);
}
