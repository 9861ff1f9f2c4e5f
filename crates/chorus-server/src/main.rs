//! Standalone SFU server binary.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chorus_core::adapters::http::{router, AppState};
use chorus_core::adapters::media::PeerFactory;
use chorus_core::adapters::sfu::registry::RoomRegistry;
use chorus_core::config::SfuConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(SfuConfig::from_env());
    let state = Arc::new(AppState {
        registry: RoomRegistry::new(),
        media: Arc::new(PeerFactory::new(&config)),
        config: Arc::clone(&config),
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "SFU server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

