//! `elowen prompt`: render what a generation would send, without a backend.

use std::path::Path;

use elowen_agent::PromptAssembler;
use elowen_config::{AppConfig, HistoryConfig};
use elowen_core::{CharacterCard, RawTurn, sanitize};

pub async fn run(
    character: &str,
    history: Option<&str>,
    input: &str,
    messages: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let max_pairs = match AppConfig::load() {
        Ok(config) => config.history.max_pairs,
        Err(e) => {
            tracing::warn!(error = %e, "Config unavailable, using default history window");
            HistoryConfig::default().max_pairs
        }
    };

    let card: CharacterCard = parse_json_arg(character)?;
    let raw: Vec<RawTurn> = match history {
        Some(arg) => parse_json_arg(arg)?,
        None => Vec::new(),
    };

    println!("{}", render(&card, &raw, input, max_pairs, messages)?);
    Ok(())
}

/// Render the flattened prompt, or the chat turns as pretty JSON.
fn render(
    card: &CharacterCard,
    raw: &[RawTurn],
    input: &str,
    max_pairs: usize,
    messages: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    if input.trim().is_empty() {
        return Err("input must not be empty".into());
    }

    let assembler = PromptAssembler::default();
    let history = sanitize(raw, max_pairs);

    if messages {
        let turns = assembler.build_messages(card, &history, input)?;
        Ok(serde_json::to_string_pretty(&turns)?)
    } else {
        Ok(assembler.build_prompt(card, &history, input))
    }
}

/// Accept either inline JSON or a path to a JSON file.
fn parse_json_arg<T: serde::de::DeserializeOwned>(arg: &str) -> Result<T, Box<dyn std::error::Error>> {
    let trimmed = arg.trim_start();
    let text = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        arg.to_string()
    } else {
        let path = Path::new(arg);
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {e}", path.display()))?
    };
    Ok(serde_json::from_str(&text)?)
}
