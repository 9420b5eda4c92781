#![forbid(unsafe_code)]

//! **courier-service** – Service binary for the Courier messaging substrate.
//!
//! Composes the full component graph (store, audit, security, registry,
//! engine, notification protocol, webhook manager, end-task manager) and
//! serves the HTTP + WebSocket surface under `/api/v1`.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory store, defaults
//! courier-service
//!
//! # Durable JSON-lines store on a custom port
//! COURIER_STORE=jsonl COURIER_STORE_PATH=data/store.jsonl courier-service --port 8080
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 store
//! unavailable, 3 listen failure.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_store_core::EventStore;
use courier_store_jsonl::JsonlStore;
use courier_store_memory::MemoryStore;

mod config;
mod error;
mod routes;
mod state;
mod tasks;
mod ws;

use config::{ServiceConfig, StoreBackend};
use state::AppState;

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_LISTEN: i32 = 3;

#[derive(Parser)]
#[command(name = "courier-service")]
#[command(about = "Courier - orchestrator/executor messaging substrate")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("starting courier-service v{}", env!("CARGO_PKG_VERSION"));

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let store: Arc<dyn EventStore> = match &config.store {
        StoreBackend::Memory => {
            info!("using in-memory event store");
            MemoryStore::shared()
        }
        StoreBackend::Jsonl(path) => match JsonlStore::open(path).await {
            Ok(store) => {
                info!(path = %path, "using JSON-lines event store");
                Arc::new(store)
            }
            Err(e) => {
                error!(path = %path, error = %e, "event store unavailable");
                std::process::exit(EXIT_STORE);
            }
        },
    };

    let state = match AppState::build(config, store).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "failed to build service components");
            std::process::exit(EXIT_STORE);
        }
    };

    let app = routes::router(state.clone());
    let address = format!("{}:{}", cli.host, cli.port);
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %address, error = %e, "failed to bind listener");
            std::process::exit(EXIT_LISTEN);
        }
    };
    info!(address = %address, "listening");

    let shutdown_state = state.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    shutdown_state.shutdown().await;
    info!("courier-service stopped");
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("courier={log_level},courier_service={log_level},info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            error!("failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("received shutdown signal");
}
