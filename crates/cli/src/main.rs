//! Elowen CLI: the main entry point.
//!
//! Commands:
//! - `gateway`: Start the WebSocket relay
//! - `doctor`: Diagnose config and backend health
//! - `config`: Show, locate, validate or create the config file
//! - `prompt`: Render the request a generation would send

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "elowen",
    about = "Elowen: streaming roleplay relay",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket relay
    Gateway {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Diagnose config and backend health
    Doctor,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Render the prompt or chat messages for a request without calling the backend
    Prompt {
        /// Character card as JSON, or a path to a JSON file
        #[arg(short, long)]
        character: String,

        /// History as a JSON array of {role, content}, or a path to a JSON file
        #[arg(long)]
        history: Option<String>,

        /// The new user input
        #[arg(short, long)]
        input: String,

        /// Render role-tagged chat messages instead of the flattened prompt
        #[arg(long)]
        messages: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Print the config file path
    Path,
    /// Validate the configuration
    Validate,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Gateway { port } => commands::gateway::run(port).await?,
        Commands::Doctor => commands::doctor::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
        },
        Commands::Prompt {
            character,
            history,
            input,
            messages,
        } => commands::prompt::run(&character, history.as_deref(), &input, messages).await?,
    }

    Ok(())
}
