//! `elowen doctor`: diagnose config and backend health.

use elowen_config::AppConfig;
use elowen_core::Backend;
use elowen_providers::OpenAiCompatBackend;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("Elowen Doctor: System Diagnostics");
    println!("=================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_path();
    if config_path.exists() {
        println!("  ✅ Config file found at {}", config_path.display());
    } else {
        println!("  ⚠️  No config file, using defaults (run `elowen config init`)");
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Configuration valid");
            config
        }
        Err(e) => {
            println!("  ❌ Configuration invalid: {e}");
            println!("\n  Fix the config before continuing.");
            return Err(e.into());
        }
    };

    // Auth
    if let Err(e) = elowen_security::verifier_from_config(&config.auth) {
        println!("  ❌ {e}");
        issues += 1;
    } else if config.auth.require_auth {
        println!("  ✅ JWT authentication configured");
    } else {
        println!("  ⚠️  Authentication disabled (auth.require_auth = false)");
    }

    // Backend
    match OpenAiCompatBackend::from_config(&config.backend) {
        Ok(backend) => match backend.health_check().await {
            Ok(true) => {
                println!("  ✅ Backend reachable at {}", backend.base_url());
                match backend.list_models().await {
                    Ok(models) if models.iter().any(|m| m == backend.model()) => {
                        println!("  ✅ Model '{}' is served", backend.model());
                    }
                    Ok(models) => {
                        println!(
                            "  ⚠️  Model '{}' not in served models: {}",
                            backend.model(),
                            models.join(", ")
                        );
                        issues += 1;
                    }
                    Err(e) => {
                        println!("  ⚠️  Could not list models: {e}");
                        issues += 1;
                    }
                }
            }
            Ok(false) => {
                println!("  ❌ Backend at {} answered with an error", backend.base_url());
                issues += 1;
            }
            Err(e) => {
                println!("  ❌ Backend unreachable: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ Could not create backend client: {e}");
            issues += 1;
        }
    }

    println!();
    summary(issues)?;
    println!("  🎉 All checks passed!");
    Ok(())
}

/// Any issue makes the command fail, so scripts can rely on the exit code.
fn summary(issues: usize) -> Result<(), String> {
    if issues == 0 {
        Ok(())
    } else {
        Err(format!("{issues} issue(s) found. See above for details."))
    }
}
