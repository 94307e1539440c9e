//! Butlers CLI
//!
//! Operator entry point for the butler fleet: discover and scaffold roster
//! entries, start daemons, and apply database migrations.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Butlers CLI -- operate the butler fleet.
#[derive(Parser, Debug)]
#[command(name = "butlers", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List butlers in the roster with their status.
    List {
        /// Roster directory containing `<butler>/butler.toml` entries.
        #[arg(long = "dir", default_value = "roster")]
        dir: PathBuf,
    },
    /// Scaffold a new butler directory.
    Init {
        /// Butler name (also the directory and schema name).
        name: String,
        /// MCP port for the new butler.
        #[arg(long)]
        port: Option<u16>,
        /// Roster directory to create the butler in.
        #[arg(long = "dir", default_value = "roster")]
        dir: PathBuf,
    },
    /// Start daemons for all (or selected) butlers in the roster.
    Up {
        /// Roster directory.
        #[arg(long = "dir", default_value = "roster")]
        dir: PathBuf,
        /// Comma-separated butler names to start; default is all.
        #[arg(long)]
        only: Option<String>,
    },
    /// Start a single butler daemon in-process.
    Run {
        /// Butler directory containing `butler.toml`.
        #[arg(long)]
        config: PathBuf,
    },
    /// Apply migrations for one chain.
    Migrate {
        /// Migration chain (butler/schema name, e.g. `health`, `messenger`,
        /// `switchboard`).
        #[arg(long)]
        chain: String,
        /// Database DSN to migrate against.
        #[arg(long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `run` installs its own subscriber (with optional OTLP); everything
    // else gets plain fmt logging to stderr.
    if !matches!(cli.command, Command::Run { .. }) {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Command::List { dir } => commands::list::run(&dir).await,
        Command::Init { name, port, dir } => commands::init::run(&name, port, &dir),
        Command::Up { dir, only } => commands::up::run(&dir, only.as_deref()).await,
        Command::Run { config } => commands::run::run(&config).await,
        Command::Migrate { chain, url } => commands::migrate::run(&chain, &url).await,
    }
}
