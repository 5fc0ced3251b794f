mod client;
mod container;
mod health;
mod lifecycle;
mod runtime;

pub use client::{DockerClient, DockerConfig};
pub use container::{
    ContainerLifecycle, ContainerState, ContainerStats, HealthStatus, ManagerCounters, ManagerStats,
};
pub use lifecycle::{validate_container_id, ContainerLifecycleManager, MIN_CONTAINER_ID_LEN};
pub use runtime::{ContainerInspection, ContainerRuntime};

pub(crate) use lifecycle::bounded;
