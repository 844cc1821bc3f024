//! wirebus server binary.
//!
//! - WebSocket endpoint: /v1/bus?api_key=...&platform=...
//! - Default relay handler: inbound messages are routed to the recipient
//!   named by their `message_dim`
//! - Ctrl-C triggers the staged shutdown sequence

use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use wirebus_server::{config, services::RelayHandler, BusServer};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = match config::load_from_file("wirebus.yaml") {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed, using defaults");
            config::ServerConfig::default()
        }
    };

    let server = BusServer::new(cfg);
    server.handlers().register_default(Arc::new(RelayHandler));

    if let Err(e) = server.start().await {
        tracing::error!(error = %e, "startup failed");
        return;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal wait failed");
    }
    if let Err(e) = server.stop().await {
        tracing::error!(error = %e, "shutdown failed");
    }
}
