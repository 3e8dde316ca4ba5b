//! `elowen config`: configuration management commands.

use elowen_config::AppConfig;

const REDACTED: &str = "[REDACTED]";

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();

            if config.auth.require_auth && config.auth.jwt_secret.is_none() {
                warnings.push("auth.require_auth is set but no JWT secret is configured (set JWT_SECRET)");
            }

            if !config.auth.require_auth {
                warnings.push("Authentication is disabled; every connection will be admitted");
            }

            if config.gateway.host == "0.0.0.0" && !config.gateway.allow_public_bind {
                warnings.push("Gateway bound to 0.0.0.0 without allow_public_bind = true");
            }

            if config.backend.request_timeout_secs == Some(0) {
                warnings.push("backend.request_timeout_secs = 0 fails every request");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Backend:   {}", config.backend.base_url);
            println!("   Model:     {}", config.backend.model);
            println!("   Style:     {:?}", config.backend.call_style);
            println!("   History:   {} pairs", config.history.max_pairs);
            println!(
                "   Gateway:   {}:{}",
                config.gateway.host, config.gateway.port
            );
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", redacted_toml(&config)?);
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_path();
    if config_path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("✅ Wrote {}", config_path.display());
    Ok(())
}

/// TOML of the config with every secret replaced.
fn redacted_toml(config: &AppConfig) -> Result<String, toml::ser::Error> {
    let mut config = config.clone();
    if config.backend.api_key.is_some() {
        config.backend.api_key = Some(REDACTED.into());
    }
    if config.auth.jwt_secret.is_some() {
        config.auth.jwt_secret = Some(REDACTED.into());
    }
    toml::to_string_pretty(&config)
}
