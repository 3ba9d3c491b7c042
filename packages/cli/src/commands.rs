// ABOUTME: Subcommand handlers wiring settings, storage and the Docker runtime into the manager
// ABOUTME: Maps sandbox errors to short tenant-facing messages

use crate::output;
use crate::Commands;
use anyhow::{Context, Result};
use chunkhost_sandbox::{
    AbuseMonitor, ContainerRuntime, DockerRuntime, SandboxError, SandboxManager, SandboxSettings,
    SandboxStorage,
};
use colored::*;
use std::sync::Arc;
use tracing::{error, info};

struct App {
    manager: SandboxManager,
    runtime: Arc<DockerRuntime>,
    storage: SandboxStorage,
    settings: SandboxSettings,
}

async fn bootstrap() -> Result<App> {
    let settings = SandboxSettings::from_env().context("Invalid configuration")?;

    let pool = chunkhost_storage::connect(&settings.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database_url))?;
    let storage = SandboxStorage::new(pool);

    let runtime = Arc::new(DockerRuntime::new().context("Failed to connect to Docker")?);
    let manager = SandboxManager::new(storage.clone(), runtime.clone(), settings.clone());

    Ok(App {
        manager,
        runtime,
        storage,
        settings,
    })
}

/// Log the full cause and keep only the tenant-facing message
fn report(err: SandboxError) -> anyhow::Error {
    error!("{}", err);
    anyhow::anyhow!(err.user_message())
}

pub async fn handle_command(command: Commands) -> Result<()> {
    let app = bootstrap().await?;

    match command {
        Commands::Create { owner } => {
            let summary = app.manager.create_sandbox(&owner).await.map_err(report)?;

            println!("{}", "Sandbox created".green().bold());
            for line in output::credentials_block(&summary) {
                println!("  {}", line);
            }
            println!(
                "{}",
                "Store these passwords now; they will not be shown again.".dimmed()
            );
        }
        Commands::List { owner, json } => {
            let sandboxes = app.manager.list_sandboxes(&owner).await.map_err(report)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&sandboxes)?);
            } else if sandboxes.is_empty() {
                println!("{}", format!("No sandboxes for {}", owner).yellow());
            } else {
                println!("{}", output::sandbox_table(&sandboxes));
                println!(
                    "Total: {} of {}",
                    sandboxes.len().to_string().cyan(),
                    app.settings.max_per_tenant
                );
            }
        }
        Commands::Delete { owner, sandbox_id } => {
            app.manager
                .delete_sandbox(&owner, &sandbox_id)
                .await
                .map_err(report)?;
            println!("{}", format!("Sandbox {} deleted", sandbox_id).green());
        }
        Commands::ReclaimImages => {
            let reclaimed = app.manager.reclaim_orphaned_images().await.map_err(report)?;
            println!(
                "Reclaimed {} images, {} still pending",
                reclaimed.reclaimed.len().to_string().green(),
                reclaimed.remaining.len().to_string().yellow()
            );
        }
        Commands::CleanupContainers { dry_run } => {
            let cleanup = app
                .manager
                .cleanup_orphaned_containers(dry_run)
                .await
                .map_err(report)?;
            if dry_run {
                println!("Found {} orphaned containers (dry run)", cleanup.orphaned);
            } else {
                println!(
                    "Found {} orphaned containers, removed {}",
                    cleanup.orphaned, cleanup.removed
                );
            }
            for message in &cleanup.errors {
                eprintln!("  {}", message.red());
            }
        }
        Commands::Scan => {
            let monitor = AbuseMonitor::new(
                app.storage.clone(),
                app.runtime.clone(),
                app.settings.monitor_interval,
            );
            let flags = monitor.scan().await?;
            if flags.is_empty() {
                println!("{}", "No suspicious processes found".green());
            } else {
                println!("{}", output::abuse_table(&flags));
            }
        }
        Commands::Monitor => {
            let monitor = Arc::new(AbuseMonitor::new(
                app.storage.clone(),
                app.runtime.clone(),
                app.settings.monitor_interval,
            ));
            let handle = monitor.start();

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutting down abuse monitor");
            handle.abort();
        }
        Commands::Status => {
            if app.runtime.is_available().await? {
                println!("{}", "Docker is available".green());
            } else {
                anyhow::bail!("Docker daemon is not reachable");
            }
        }
    }

    Ok(())
}
