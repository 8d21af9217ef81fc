//! promptstack - sandbox orchestration for prompt-driven app builders.
//!
//! This is the main entry point for the promptstack CLI.

mod commands;

use clap::{Parser, Subcommand};
use commands::{init_logging, list_stacks, prepare_sandboxes, run_server};
use promptstack_core::EngineConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "promptstack")]
#[command(author, version, about = "Sandbox orchestration engine for prompt-driven app builders", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the one in the data directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Address to bind to (defaults to server.address from config)
        #[arg(short, long)]
        address: Option<SocketAddr>,
    },
    /// Run one pool maintenance pass: evict stale entries and top up
    PrepareSandboxes {
        /// Only print how many sandboxes each stack is missing
        #[arg(long)]
        dry_run: bool,
    },
    /// List the built-in stacks
    Stacks,
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    let (config, sources) = EngineConfig::load(cli.config.as_deref()).await?;
    let serving = matches!(cli.command, Commands::Serve { .. });
    let log_file = init_logging(cli.verbose, serving, config.log_level.as_deref());
    debug!(?sources, ?log_file, "Configuration loaded");

    match cli.command {
        Commands::Serve { address } => run_server(config, address).await,
        Commands::PrepareSandboxes { dry_run } => prepare_sandboxes(config, dry_run).await,
        Commands::Stacks => {
            list_stacks();
            Ok(())
        }
        Commands::Version => Ok(()),
    }
}

fn print_version() {
    println!("promptstack {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Sandbox orchestration for prompt-driven app builders.");
}
