use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use porter::commands::{self, sessions::SessionsCommand, token::TokenCommand};
use porter::config::Config;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "porter",
    version,
    about = "Expose a local worker CLI as an A2A agent server"
)]
struct Cli {
    /// Path to the TOML config file (falls back to PORTER_CONFIG, then ./porter.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the A2A server (the default when no subcommand is given).
    Serve,
    /// Mint, revoke, and list bearer tokens.
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    /// Inspect or remove persisted sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Print session, agent, and budget statistics.
    Stats,
    /// Validate the configuration and print a summary.
    ConfigCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => commands::serve::run(config).await,
        Command::Token { command } => commands::token::run(&config, command),
        Command::Sessions { command } => commands::sessions::run(&config, command),
        Command::Stats => commands::stats::run(&config),
        Command::ConfigCheck => {
            println!(
                "configuration OK: {} agents ({} enabled), data dir {}",
                config.agents.len(),
                config.agents.iter().filter(|agent| agent.enabled).count(),
                config.server.data_dir.display(),
            );
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "fatal error");
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

/// `LOG_LEVEL` feeds the tracing filter; `info` when unset.
fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}
