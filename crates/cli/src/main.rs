use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod settings;

use error::CliResult;
use settings::SettingsStore;

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "Chat with an OpenAI-compatible endpoint from the terminal", long_about = None)]
struct Cli {
    /// Settings file to use instead of the per-user default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a chat session, optionally from a deep link
    Chat(commands::chat::ChatArgs),
    /// List stored sessions, most recent first
    Sessions,
    /// Delete a stored session
    Forget {
        /// Session id as printed by `palaver sessions`
        session: String,
    },
    /// Set the model selected when a session opens
    UseModel {
        model: String,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    // Logs go to stderr so they never interleave with streamed answers.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings_store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };

    match cli.command {
        Commands::Chat(args) => commands::chat::run(&settings_store, args).await,
        Commands::Sessions => commands::sessions::list(&settings_store).await,
        Commands::Forget { session } => commands::sessions::forget(&settings_store, &session).await,
        Commands::UseModel { model } => commands::model::use_model(&settings_store, &model),
    }
}
