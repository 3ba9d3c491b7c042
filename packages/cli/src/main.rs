// ABOUTME: ChunkHost operator CLI entry point
// ABOUTME: Loads configuration, initializes logging and dispatches sandbox subcommands

use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "chunkhost")]
#[command(about = "ChunkHost - per-tenant VPS sandboxes on Docker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new sandbox for a tenant
    Create {
        /// Tenant that will own the sandbox
        #[arg(short, long)]
        owner: String,
    },
    /// List a tenant's sandboxes
    List {
        /// Tenant whose sandboxes to list
        #[arg(short, long)]
        owner: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete one of a tenant's sandboxes
    Delete {
        /// Tenant that owns the sandbox
        #[arg(short, long)]
        owner: String,
        /// Sandbox ID to delete
        sandbox_id: String,
    },
    /// Retry removal of images whose cleanup failed earlier
    ReclaimImages,
    /// Remove managed containers that no sandbox record references
    CleanupContainers {
        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },
    /// Scan every sandbox once for crypto-miner processes
    Scan,
    /// Run the abuse scan periodically until interrupted
    Monitor,
    /// Check that the Docker daemon is reachable
    Status,
}

/// Filter from the log-level variable, or `info` when it is unset or invalid
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(chunkhost_config::RUST_LOG).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    if let Err(e) = commands::handle_command(cli.command).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_filter_reads_log_variable() {
        std::env::set_var(chunkhost_config::RUST_LOG, "chunkhost_sandbox=debug");
        assert_eq!(log_filter().to_string(), "chunkhost_sandbox=debug");

        std::env::remove_var(chunkhost_config::RUST_LOG);
        assert_eq!(log_filter().to_string(), "info");
    }
}
