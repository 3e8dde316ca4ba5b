//! WebSocket gateway for the Elowen relay.
//!
//! Exposes `GET /ws` for the relay protocol and `GET /health` for probes.
//! Built on Axum.

pub mod relay;
pub mod ws;

use std::sync::Arc;

use elowen_agent::{PromptAssembler, SessionSettings};
use elowen_core::Backend;
use elowen_security::SessionRegistry;
use tracing::info;

pub use relay::RelayServer;
pub use ws::{WsSettings, router};

/// Assemble a relay from configuration around an already-built backend.
pub fn build_relay(
    config: &elowen_config::AppConfig,
    backend: Arc<dyn Backend>,
) -> Result<RelayServer, elowen_security::SecurityError> {
    let verifier = elowen_security::verifier_from_config(&config.auth)?;
    Ok(RelayServer::new(
        backend,
        Arc::new(PromptAssembler::default()),
        SessionSettings::from_config(config),
        config.generation.clone(),
        Arc::new(SessionRegistry::new()),
        verifier,
    ))
}

/// Serve the relay on an already-bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    config: elowen_config::AppConfig,
    backend: Arc<dyn Backend>,
) -> Result<(), Box<dyn std::error::Error>> {
    let relay = Arc::new(build_relay(&config, backend)?);
    let app = router(relay, WsSettings::from_config(&config.gateway));

    info!(addr = %listener.local_addr()?, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the gateway with the configured backend.
pub async fn start(config: elowen_config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let backend = elowen_providers::build_from_config(&config)?;

    info!(addr = %addr, backend = backend.name(), model = backend.model(), "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve(listener, config, backend).await
}
