#![cfg_attr(not(test), forbid(unsafe_code))]

//! Command-line entry point for the `EventStream` server.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;
use std::path::PathBuf;


/// Command-line interface for the `EventStream` server.
#[derive(Parser, Debug)]
#[command(name = "eventstream")]
#[command(about = "Server-Sent Events fan-out with durable catch-up", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for the `EventStream` CLI.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the SSE server
    Serve {
        /// Overrides `server.port` from the configuration.
        #[arg(
            long,
            short,
            help = "The port number to bind the server to (e.g., 8080). Overrides the configuration file."
        )]
        port: Option<u16>,

        /// Path to the configuration file (optional)
        #[arg(
            long,
            short,
            help = "Path to the configuration file (yaml, json or toml). If not provided, defaults and environment variables are used."
        )]
        config: Option<PathBuf>,
    },
}

/// Loads the configuration and runs the server until shutdown.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(
    port: Option<u16>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let resolved_config = Config::load_config(config, port)?;
    server::server::run(resolved_config).await
}

/// Parses the command line and dispatches the chosen subcommand.
///
/// # Errors
/// Returns an error if the subcommand fails.
pub async fn run_app(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    run_app(Cli::parse()).await
}
