//! `elowen gateway`: start the WebSocket relay.

use elowen_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if config.gateway.host == "0.0.0.0" && !config.gateway.allow_public_bind {
        return Err("Refusing to bind 0.0.0.0 without gateway.allow_public_bind = true".into());
    }

    println!("Elowen Gateway");
    println!("   Listening: ws://{}:{}/ws", config.gateway.host, config.gateway.port);
    println!("   Backend:   {} ({})", config.backend.base_url, config.backend.model);
    println!("   Auth:      {}", if config.auth.require_auth { "JWT" } else { "disabled" });

    elowen_gateway::start(config).await?;

    Ok(())
}
