#![cfg_attr(not(test), forbid(unsafe_code))]

//! Entry point for the ChatRelay server binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;

/// Command line of the ChatRelay server.
#[derive(Debug, Parser)]
#[command(name = "chatrelay-server")]
#[command(about = "Streams chat replies to live observers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Server subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind, overriding the configuration file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a configuration file (toml, yaml or json)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the resolved configuration
    Config {
        /// Path to a configuration file (toml, yaml or json)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "toml", value_parser = ["toml", "yaml", "json"])]
        format: String,
    },
}

/// Loads `.env` and parses the command line.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

/// Resolves configuration and runs the server until shutdown.
///
/// # Errors
/// Returns an error if configuration is invalid or the server fails to start.
pub async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port)?;
    server::server::run(resolved).await
}

fn handle_config_command(config: Option<PathBuf>, format: &str) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, None)?;
    println!("{}", resolved.render(format)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = initialize_cli();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
        Commands::Config { config, format } => handle_config_command(config, &format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_line_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_accepts_optional_port() {
        let cli = Cli::try_parse_from(["chatrelay-server", "serve", "--port", "9100"]).unwrap();
        match cli.command {
            Commands::Serve { port, config } => {
                assert_eq!(port, Some(9100));
                assert!(config.is_none());
            }
            Commands::Config { .. } => panic!("expected serve"),
        }

        let cli = Cli::try_parse_from(["chatrelay-server", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { port: None, .. }));
    }
}
