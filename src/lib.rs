//! Lifecycle and resource governance for sandboxed repository-analysis containers.
//!
//! [`docker::ContainerLifecycleManager`] owns one record per container and drives it
//! through its states, with health monitoring and bounded recovery.
//! [`resources::ResourceMonitor`] samples CPU, memory, process count and elapsed time
//! and enforces the configured thresholds back through the lifecycle manager.

pub mod config;
pub mod docker;
pub mod error;
pub mod resources;
pub mod shared;

pub use config::{GovernorConfig, LifecycleConfig, ResourceThresholds};
pub use docker::{
    ContainerLifecycleManager, ContainerRuntime, ContainerState, ContainerStats, DockerClient,
    ManagerStats,
};
pub use error::{Result, SandboxError};
pub use resources::{ResourceMonitor, ResourceStatistics, ResourceUsage, ResourceViolation};
