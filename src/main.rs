use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use sandbox_governor::config::GovernorConfig;
use sandbox_governor::docker::{
    ContainerLifecycleManager, ContainerRuntime, ContainerState, DockerClient,
};
use sandbox_governor::resources::ResourceMonitor;
use sandbox_governor::shared::{event_channel, logging, spawn_event_logger};

#[derive(Parser)]
#[command(name = "sandbox-governor")]
#[command(
    about = "Lifecycle and resource governance for sandboxed analysis containers",
    long_about = None
)]
struct Cli {
    /// YAML configuration file; environment variables override its values
    #[arg(short, long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Govern running containers until Ctrl-C, then tear them down
    Watch {
        /// Ids of the containers to govern
        #[arg(value_name = "CONTAINER_ID", required = true)]
        container_ids: Vec<String>,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GovernorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Watch { container_ids } => {
            let _guards = logging::init_logging(&config.log_dir, "sandbox-governor")?;
            run_watch(config, container_ids).await?;
        }
    }

    Ok(())
}

async fn run_watch(config: GovernorConfig, container_ids: Vec<String>) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerClient::new(&config.docker)
            .await
            .context("Failed to connect to Docker daemon")?,
    );

    let (events, event_rx) = event_channel();
    let audit = spawn_event_logger(event_rx);

    let lifecycle =
        ContainerLifecycleManager::new(runtime.clone(), config.lifecycle.clone(), events.clone());
    let resources =
        ResourceMonitor::new(runtime, lifecycle.clone(), config.thresholds.clone(), events)?;

    for container_id in &container_ids {
        if let Err(e) = govern(&lifecycle, &resources, container_id).await {
            error!("Could not govern container {}: {}", container_id, e);
        }
    }

    info!("Governing {} container(s), press Ctrl-C to stop", container_ids.len());
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    info!("Shutting down sandbox governor...");
    resources.shutdown().await;
    lifecycle.shutdown().await;

    let manager_stats = lifecycle.get_manager_stats().await;
    let resource_stats = resources.get_resource_statistics().await;
    info!(
        "Final stats: {} stops ({} failed), {} recoveries ({} failed), {} violations, \
         {} enforced terminations",
        manager_stats.successful_stops,
        manager_stats.failed_stops,
        manager_stats.recovery_successful,
        manager_stats.recovery_failed,
        resource_stats.total_violations,
        resource_stats.terminated_count
    );

    // Dropping the managers closes the event channel once background tasks have exited
    drop(resources);
    drop(lifecycle);
    let _ = tokio::time::timeout(Duration::from_secs(1), audit).await;

    Ok(())
}

async fn govern(
    lifecycle: &ContainerLifecycleManager,
    resources: &ResourceMonitor,
    container_id: &str,
) -> Result<()> {
    lifecycle
        .register_container(container_id, Some(serde_json::json!({ "source": "watch" })))
        .await?;
    lifecycle
        .update_container_state(container_id, ContainerState::Running)
        .await?;
    lifecycle.start_health_monitoring(container_id).await?;
    resources.start_monitoring(container_id).await?;
    Ok(())
}
