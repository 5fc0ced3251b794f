use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// What the runtime reports about a container at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspection {
    pub running: bool,
    /// Status of the image's health probe, `None` when the image defines no probe.
    pub health_status: Option<String>,
}

impl ContainerInspection {
    pub fn running() -> Self {
        Self {
            running: true,
            health_status: None,
        }
    }

    pub fn stopped() -> Self {
        Self::default()
    }
}

/// Operations the engine needs from the isolation layer.
///
/// Every call may fail or hang; callers bound each one with their own deadline.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, container_id: &str) -> Result<()>;

    async fn stop(&self, container_id: &str, grace_period: Duration) -> Result<()>;

    async fn kill(&self, container_id: &str, signal: &str) -> Result<()>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection>;

    /// Resolves once the container no longer exists, including when it was already gone.
    async fn wait_for_removal(&self, container_id: &str) -> Result<()>;

    /// One line shaped like `docker stats --format
    /// "{{.CPUPerc}}|{{.MemUsage}}|{{.MemPerc}}|{{.NetIO}}|{{.PIDs}}"`.
    async fn usage_snapshot(&self, container_id: &str) -> Result<String>;
}
