//! drawroom relay server: real-time room fan-out for whiteboard clients.
//!
//! An axum WebSocket server that groups browser clients into rooms and
//! rebroadcasts their drawing operations to the other members of the room.
//! Room contents are never stored; a restart drops every room.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8080
//! cargo run --bin drawroom-relay
//!
//! # Run on a custom port
//! cargo run --bin drawroom-relay -- --port 9000
//!
//! # Or via environment variable
//! PORT=9000 cargo run --bin drawroom-relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use drawroom_relay::config::{RelayCliArgs, RelayConfig};
use drawroom_relay::relay::{self, RelayState};

/// How long writer tasks get to flush close frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting drawroom relay");

    let state = Arc::new(RelayState::with_config(
        config.max_message_size,
        config.ping_interval(),
    ));

    let (bound_addr, mut handle) =
        match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "failed to start relay server");
                std::process::exit(1);
            }
        };
    tracing::info!(addr = %bound_addr, "relay listening");

    tokio::select! {
        result = &mut handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!(rooms = state.rooms.room_count().await, "shutting down");
            state.rooms.close_all().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            handle.abort();
        }
    }
}
