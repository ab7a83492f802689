#![cfg_attr(not(test), forbid(unsafe_code))]

//! ChatRelay command-line client: server launcher, message sender, live
//! observer and history pager.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use dotenv::dotenv;
use server::server;
use shared::config::server::Config;
use tracing_subscriber::EnvFilter;

pub mod client;
pub mod commands;
pub mod observer;
pub mod transport;

/// ChatRelay CLI
#[derive(Debug, Parser)]
#[command(name = "ChatRelay CLI")]
#[command(about = "Command-line interface for ChatRelay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the ChatRelay server
    Serve {
        /// Port to bind, overriding the configuration file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a configuration file (toml, yaml or json)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Send a message and print the streamed reply
    Send(commands::send::SendArgs),
    /// Follow a conversation, or the conversation list, live
    Watch(commands::watch::WatchArgs),
    /// Print the stored messages of a conversation
    History(commands::history::HistoryArgs),
    /// Generate a configuration file with the default settings
    Config {
        /// Output format
        #[arg(long, short, default_value = "toml", value_parser = ["toml", "yaml", "json"])]
        format: String,

        /// File to write; prints to stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Generate shell completion scripts for the CLI
    Completion {
        /// Target shell
        #[arg(long, short, value_enum)]
        shell: Shell,
    },
}

/// Client commands log to stderr so stdout stays clean for output.
fn initialize_client_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Loads `.env` and parses the command line.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

/// Runs one parsed command.
///
/// # Errors
/// Returns the command's failure.
pub async fn run(cli: Cli) -> Result<()> {
    if !matches!(cli.command, Commands::Serve { .. }) {
        initialize_client_tracing();
    }

    match cli.command {
        Commands::Serve { port, config } => {
            let resolved_config = Config::load_config(config, port)?;
            server::run(resolved_config).await?;
        }
        Commands::Send(args) => commands::send::handle_send(args).await?,
        Commands::Watch(args) => commands::watch::handle_watch(args).await?,
        Commands::History(args) => commands::history::handle_history(args).await?,
        Commands::Config { format, output } => {
            commands::config::generate_config(&format, output.as_deref())?;
        }
        Commands::Completion { shell } => {
            commands::completion::generate_completion(shell, &mut std::io::stdout());
        }
    }

    Ok(())
}
