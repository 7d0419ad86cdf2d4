use std::sync::Arc;

use dashmap::DashMap;
use tokio::signal;
use tracing::info;
use warp::Filter;

use relay_sfu::health::healthz_route;
use relay_sfu::metrics::register_metrics;
use relay_sfu::signaling_handler::{ws_route, SignalingState};
use relay_sfu::Registry;

mod config;
mod logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::validate_env().unwrap_or_else(|e| {
        eprintln!("Environment validation failed: {}", e);
        std::process::exit(1);
    });

    logging::init(&cfg.rust_log);
    register_metrics();

    let state = SignalingState {
        registry: Arc::new(Registry::new(cfg.room_grace_secs)),
        tracks: Arc::new(DashMap::new()),
        token_secret: cfg.token_secret.clone().map(Arc::new),
        send_queue_capacity: cfg.send_queue_capacity,
        keepalive_interval_secs: cfg.keepalive_interval_secs,
    };

    let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = vec![];
        let metric_families = prometheus::gather();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    });

    let routes = ws_route(state).or(metrics_route).or(healthz_route());

    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.signaling_port).parse()?;
    info!("SFU signaling server listening on {}", addr);

    let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
        info!("received shutdown signal (SIGINT/SIGTERM)");
    });

    server.await;
    info!("SFU shutdown complete");
    Ok(())
}
