//! callscope server binary.
//!
//! Wires the engine control client, the spy service, and the HTTP surface
//! together, then serves until interrupted. Shutdown drains in-flight HTTP
//! handlers first, then releases every remaining spy source so the engine
//! is not left holding orphaned subscriptions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use callscope::config::Config;
use callscope::engine::UdpClient;
use callscope::server::{create_router, AppState, MonitorMetrics, SpyService};

/// Grace period for HTTP drain, and again for the source drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callscope=info,tower_http=info".into()),
        )
        .init();

    let cfg = Config::from_env();
    info!(
        http_port = cfg.http_port,
        engine_addr = %cfg.engine_addr,
        webrtc_ports = %format!("{}-{}", cfg.webrtc_min_port, cfg.webrtc_max_port),
        telemetry_endpoint = cfg.telemetry_endpoint.as_deref().unwrap_or("disabled"),
        "starting callscope"
    );

    let engine = Arc::new(
        UdpClient::new(&cfg.engine_addr)
            .await
            .with_context(|| format!("connect engine control channel {}", cfg.engine_addr))?,
    );

    let ice_socket = if cfg.webrtc_ice_port != 0 {
        let bind_addr = format!("{}:{}", cfg.webrtc_ice_address, cfg.webrtc_ice_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("bind browser ICE socket {bind_addr}"))?;
        info!(addr = %bind_addr, "browser ICE multiplexed on a single port");
        Some(socket)
    } else {
        None
    };

    let metrics = Arc::new(MonitorMetrics::default());
    let spy = SpyService::new(cfg.clone(), engine.clone(), ice_socket, metrics.clone())
        .context("initialise spy service")?;

    let state = Arc::new(AppState::new(
        engine,
        spy.clone(),
        metrics,
        cfg.engine_addr.clone(),
    ));
    let app = create_router(state, &cfg.static_dir);

    let bind_addr = format!("0.0.0.0:{}", cfg.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind http listener {bind_addr}"))?;
    info!(addr = %bind_addr, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // HTTP is drained; now release backend state within the same grace
    // period the HTTP side got.
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, spy.shutdown())
        .await
        .is_err()
    {
        warn!("source drain exceeded the shutdown deadline");
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}
