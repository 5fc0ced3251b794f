use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, KillContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, HealthStatusEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::runtime::{ContainerInspection, ContainerRuntime};
use crate::error::{Result, SandboxError};
use crate::resources::format_memory_size;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket_path: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            connect_timeout_secs: 120,
        }
    }
}

/// Production runtime talking to the Docker daemon.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub async fn new(config: &DockerConfig) -> Result<Self> {
        let docker = match &config.socket_path {
            Some(socket) => {
                let timeout = config.connect_timeout_secs;
                Docker::connect_with_socket(socket, timeout, API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_socket_defaults()?,
        };

        let version = docker.version().await?;
        info!("Connected to Docker daemon version: {}", version.version.unwrap_or_default());

        Ok(Self { docker })
    }

    async fn inspect_raw(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect", id, e))
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start", container_id, e))?;

        info!("Started container: {}", container_id);
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace_period: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace_period.as_secs() as i64,
        };

        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| map_error("stop", container_id, e))?;

        info!("Stopped container: {}", container_id);
        Ok(())
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions { signal };

        self.docker
            .kill_container(container_id, Some(options))
            .await
            .map_err(|e| map_error("kill", container_id, e))?;

        info!("Sent {} to container: {}", signal, container_id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection> {
        let response = self.inspect_raw(container_id).await?;
        let state = response.state.unwrap_or_default();

        let health_status = state
            .health
            .and_then(|health| health.status)
            .and_then(|status| match status {
                HealthStatusEnum::STARTING => Some("starting"),
                HealthStatusEnum::HEALTHY => Some("healthy"),
                HealthStatusEnum::UNHEALTHY => Some("unhealthy"),
                _ => None,
            })
            .map(str::to_string);

        Ok(ContainerInspection {
            running: state.running.unwrap_or(false),
            health_status,
        })
    }

    async fn wait_for_removal(&self, container_id: &str) -> Result<()> {
        let options = WaitContainerOptions {
            condition: "removed",
        };
        let mut stream = Box::pin(self.docker.wait_container(container_id, Some(options)));

        match stream.next().await {
            Some(Ok(response)) => {
                debug!("Container {} removed with status {}", container_id, response.status_code);
                Ok(())
            }
            Some(Err(BollardError::DockerResponseServerError { status_code: 404, .. })) => {
                debug!("Container {} already gone", container_id);
                Ok(())
            }
            // Non-zero exit codes surface as wait errors; the container is gone either way
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                debug!("Container {} exited with code {} before removal", container_id, code);
                Ok(())
            }
            Some(Err(e)) => Err(map_error("wait", container_id, e)),
            None => Err(SandboxError::runtime(
                "wait",
                container_id,
                "wait stream ended unexpectedly",
            )),
        }
    }

    async fn usage_snapshot(&self, container_id: &str) -> Result<String> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = Box::pin(self.docker.stats(container_id, Some(options)));
        match stream.next().await {
            Some(Ok(stats)) => Ok(render_stats_line(&stats)),
            Some(Err(e)) => Err(map_error("stats", container_id, e)),
            None => Err(SandboxError::runtime("stats", container_id, "no stats available")),
        }
    }
}

fn map_error(operation: &'static str, container_id: &str, err: BollardError) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError { status_code: 404, .. } => {
            SandboxError::NotFound(container_id.to_string())
        }
        other => SandboxError::runtime(operation, container_id, other),
    }
}

/// Renders a stats frame the way `docker stats` prints it.
fn render_stats_line(stats: &Stats) -> String {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0)) as f64;
    let online_cpus = stats
        .cpu_stats
        .online_cpus
        .or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u64)
        })
        .unwrap_or(1) as f64;

    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        cpu_delta / system_delta * online_cpus * 100.0
    } else {
        0.0
    };

    let memory_used = stats.memory_stats.usage.unwrap_or(0);
    let memory_limit = stats.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        memory_used as f64 / memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks
                .values()
                .fold((0u64, 0u64), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
        })
        .unwrap_or((0, 0));

    let pids = stats.pids_stats.current.unwrap_or(0);

    format!(
        "{:.2}%|{} / {}|{:.2}%|{} / {}|{}",
        cpu_percent,
        format_memory_size(memory_used),
        format_memory_size(memory_limit),
        memory_percent,
        format_memory_size(rx),
        format_memory_size(tx),
        pids
    )
}
