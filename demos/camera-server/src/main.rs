//! Remote camera server backed by simulated cameras.
//!
//! Run with: cargo run -p camera-server
//!
//! Then connect a WebSocket client to ws://127.0.0.1:3000/ws.

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::routing::get;
use camera_remote_core::simulated::{SimulatedCameraConfig, SimulatedFactory};
use camera_remote_session::{EndpointConfig, HostContext};
use camera_remote_transport::{ServerContext, websocket::create_ws_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Server settings read from the environment.
#[derive(Debug, Clone)]
struct ServerConfig {
    addr: SocketAddr,
    cameras: u32,
    frame_interval: Duration,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            addr: env_or("CAMERA_REMOTE_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000))),
            cameras: env_or("CAMERA_REMOTE_CAMERAS", 2),
            frame_interval: Duration::from_millis(env_or("CAMERA_REMOTE_FRAME_MS", 200)),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    let bound = listener.local_addr()?;

    let factory = SimulatedFactory::new(config.cameras).with_config(SimulatedCameraConfig {
        frame_interval: config.frame_interval,
        ..SimulatedCameraConfig::default()
    });
    let context = ServerContext::new(Arc::new(factory), HostContext::new(vec![bound]))
        .with_config(EndpointConfig::default());

    let app = create_ws_router(context).route("/", get(|| async { "camera-server: connect to /ws" }));

    tracing::info!(cameras = config.cameras, "Server listening on ws://{bound}/ws");
    axum::serve(listener, app).await?;
    Ok(())
}
