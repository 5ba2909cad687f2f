use std::{sync::Arc, time::Instant};

use office_bridge::{
    config::BridgeConfig,
    export::PdftoppmRasterizer,
    server::{self, AppState},
    Bridge, ConnectionHub,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("office_bridge=info,addin=info")),
        )
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(message) => {
            error!("{message}");
            std::process::exit(1);
        }
    };

    if config.allow_remote {
        warn!("BRIDGE_ALLOW_REMOTE=true: non-local peers can drive office sessions");
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(bind_error) => {
            error!("failed to bind {bind_addr}: {bind_error}");
            std::process::exit(1);
        }
    };
    let port = listener
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or(config.port);

    let rasterizer = Arc::new(PdftoppmRasterizer::new(
        config.pdftoppm_bin.clone(),
        config.pdfinfo_bin.clone(),
        std::time::Duration::from_millis(config.export_timeout_ms),
    ));
    let state = AppState {
        config: config.clone(),
        port,
        started_at: Instant::now(),
        bridge: Bridge::new(Arc::new(ConnectionHub::new()), config.console_history),
        rasterizer,
    };

    info!(%bind_addr, "office-bridge listening");

    if let Err(serve_error) = server::serve(listener, state).await {
        error!("server error: {serve_error}");
        std::process::exit(1);
    }
}
