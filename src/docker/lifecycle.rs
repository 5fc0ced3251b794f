use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::container::{
    ContainerLifecycle, ContainerState, ContainerStats, ManagerCounters, ManagerStats,
};
use super::runtime::ContainerRuntime;
use crate::config::LifecycleConfig;
use crate::error::{Result, SandboxError};
use crate::shared::events::{ContainerEvent, EventSender};

/// Shortest id the runtime hands out (a short container id).
pub const MIN_CONTAINER_ID_LEN: usize = 12;

const KILL_SIGNAL: &str = "SIGKILL";

pub(crate) type CounterUpdate = fn(&mut ManagerCounters);

pub(crate) mod counters {
    use super::ManagerCounters;

    pub fn successful_start(c: &mut ManagerCounters) {
        c.successful_starts += 1;
    }

    pub fn failed_start(c: &mut ManagerCounters) {
        c.failed_starts += 1;
    }

    pub fn successful_stop(c: &mut ManagerCounters) {
        c.successful_stops += 1;
    }

    pub fn failed_stop(c: &mut ManagerCounters) {
        c.failed_stops += 1;
    }

    pub fn recovery_successful(c: &mut ManagerCounters) {
        c.recovery_successful += 1;
    }

    pub fn recovery_failed(c: &mut ManagerCounters) {
        c.recovery_failed += 1;
    }
}

pub(crate) struct Registry {
    pub(crate) containers: HashMap<String, ContainerLifecycle>,
    pub(crate) counters: ManagerCounters,
    /// Last health monitor generation handed out, across every record this manager
    /// has held. A re-registered id never reuses a generation.
    pub(crate) monitor_generations: u64,
}

/// Owns every lifecycle record and drives containers through their states.
#[derive(Clone)]
pub struct ContainerLifecycleManager {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) config: LifecycleConfig,
    pub(crate) registry: Arc<RwLock<Registry>>,
    event_sender: EventSender,
}

pub fn validate_container_id(container_id: &str) -> Result<()> {
    if container_id.is_empty() {
        return Err(SandboxError::Validation("container id is empty".to_string()));
    }
    if container_id.len() < MIN_CONTAINER_ID_LEN {
        return Err(SandboxError::Validation(format!(
            "container id {container_id:?} is shorter than {MIN_CONTAINER_ID_LEN} characters"
        )));
    }
    if !container_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SandboxError::Validation(format!(
            "container id {container_id:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Runs a runtime call under a deadline, turning expiry into [`SandboxError::Timeout`].
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    container_id: &str,
    limit: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SandboxError::Timeout {
            operation,
            container_id: container_id.to_string(),
            limit,
        }),
    }
}

impl ContainerLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: LifecycleConfig,
        event_sender: EventSender,
    ) -> Self {
        Self {
            runtime,
            config,
            registry: Arc::new(RwLock::new(Registry {
                containers: HashMap::new(),
                counters: ManagerCounters::default(),
                monitor_generations: 0,
            })),
            event_sender,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: ContainerEvent) {
        // The audit sink going away must never stall lifecycle work
        let _ = self.event_sender.send(event);
    }

    pub async fn register_container(
        &self,
        container_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        validate_container_id(container_id)?;

        {
            let mut registry = self.registry.write().await;
            if registry.containers.contains_key(container_id) {
                return Err(SandboxError::AlreadyRegistered(container_id.to_string()));
            }

            let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
            registry.containers.insert(
                container_id.to_string(),
                ContainerLifecycle::new(container_id, metadata),
            );
        }

        info!("Registered container {}", container_id);
        self.emit(ContainerEvent::Registered {
            container_id: container_id.to_string(),
        });
        Ok(())
    }

    pub async fn unregister_container(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;

        {
            let mut registry = self.registry.write().await;
            let mut record = registry
                .containers
                .remove(container_id)
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;
            record.cancel_monitor();
        }

        info!("Unregistered container {}", container_id);
        self.emit(ContainerEvent::Unregistered {
            container_id: container_id.to_string(),
        });
        Ok(())
    }

    pub async fn update_container_state(
        &self,
        container_id: &str,
        new_state: ContainerState,
    ) -> Result<()> {
        validate_container_id(container_id)?;
        self.apply_transition(container_id, None, new_state, None)
            .await
            .map(|_| ())
    }

    /// Moves `container_id` to `new_state` in one critical section and bumps `counter`.
    ///
    /// With `expected` set the move only happens when the record is still in that
    /// state; the return value says whether it happened. The counter is bumped either
    /// way, even when the record has been unregistered in the meantime.
    pub(crate) async fn apply_transition(
        &self,
        container_id: &str,
        expected: Option<ContainerState>,
        new_state: ContainerState,
        counter: Option<CounterUpdate>,
    ) -> Result<bool> {
        let from = {
            let mut registry = self.registry.write().await;
            if let Some(counter) = counter {
                counter(&mut registry.counters);
            }

            let record = registry
                .containers
                .get_mut(container_id)
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;

            if let Some(expected) = expected {
                if record.current_state != expected {
                    debug!(
                        "Container {} left {} before reaching {}, now {}",
                        container_id, expected, new_state, record.current_state
                    );
                    return Ok(false);
                }
            }
            record.transition(new_state)
        };

        debug!("Container {} transitioned {} -> {}", container_id, from, new_state);
        self.emit(ContainerEvent::StateChanged {
            container_id: container_id.to_string(),
            from,
            to: new_state,
        });
        Ok(true)
    }

    pub(crate) async fn bump(&self, counter: CounterUpdate) {
        let mut registry = self.registry.write().await;
        counter(&mut registry.counters);
    }

    pub(crate) async fn current_state(&self, container_id: &str) -> Option<ContainerState> {
        let registry = self.registry.read().await;
        registry
            .containers
            .get(container_id)
            .map(|record| record.current_state)
    }

    /// Asks the workload to exit, escalating once to [`Self::force_terminate_container`]
    /// when the stop request fails or times out.
    pub async fn graceful_stop_container(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;
        self.update_container_state(container_id, ContainerState::Stopping)
            .await?;

        info!("Stopping container {}", container_id);
        let stop = bounded(
            "stop",
            container_id,
            self.config.graceful_stop_timeout,
            self.runtime.stop(container_id, self.config.stop_grace_period),
        )
        .await;

        match stop {
            Ok(()) => {
                self.apply_transition(
                    container_id,
                    None,
                    ContainerState::Stopped,
                    Some(counters::successful_stop),
                )
                .await?;
                info!("Container {} stopped gracefully", container_id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Graceful stop of container {} failed: {}, escalating to force termination",
                    container_id, e
                );
                self.force_terminate_container(container_id).await
            }
        }
    }

    /// Kills the container outright. This is the last resort; a failed kill is reported,
    /// never retried.
    pub async fn force_terminate_container(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;
        self.update_container_state(container_id, ContainerState::Terminating)
            .await?;

        warn!("Force terminating container {}", container_id);
        let kill = bounded(
            "kill",
            container_id,
            self.config.force_kill_timeout,
            self.runtime.kill(container_id, KILL_SIGNAL),
        )
        .await;

        if let Err(e) = kill {
            self.bump(counters::failed_stop).await;
            error!("Failed to kill container {}: {}", container_id, e);
            return Err(e);
        }

        // The kill is authoritative; removal confirmation is best effort
        let removal = bounded(
            "wait",
            container_id,
            self.config.removal_wait_timeout,
            self.runtime.wait_for_removal(container_id),
        )
        .await;
        match removal {
            Ok(()) => debug!("Removal of container {} confirmed", container_id),
            Err(e) if e.is_timeout() => {
                warn!("Removal of container {} not confirmed in time", container_id)
            }
            Err(e) => warn!("Could not confirm removal of container {}: {}", container_id, e),
        }

        self.apply_transition(
            container_id,
            None,
            ContainerState::Terminated,
            Some(counters::successful_stop),
        )
        .await?;
        info!("Container {} terminated", container_id);
        Ok(())
    }

    pub async fn get_container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        validate_container_id(container_id)?;
        let registry = self.registry.read().await;
        registry
            .containers
            .get(container_id)
            .map(ContainerLifecycle::stats)
            .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))
    }

    pub async fn get_manager_stats(&self) -> ManagerStats {
        let registry = self.registry.read().await;
        let counters = &registry.counters;

        ManagerStats {
            total_containers: registry.containers.len(),
            successful_starts: counters.successful_starts,
            failed_starts: counters.failed_starts,
            successful_stops: counters.successful_stops,
            failed_stops: counters.failed_stops,
            recovery_successful: counters.recovery_successful,
            recovery_failed: counters.recovery_failed,
            active_health_monitors: registry
                .containers
                .values()
                .filter(|record| record.monitor_active)
                .count(),
        }
    }

    pub async fn container_ids(&self) -> Vec<String> {
        let registry = self.registry.read().await;
        registry.containers.keys().cloned().collect()
    }

    /// Exit-time sweep: cancels every health monitor and kills every container that is
    /// not already down. A panic while handling one container is recorded and the sweep
    /// moves on to the next.
    pub async fn shutdown(&self) {
        let targets: Vec<String> = {
            let mut registry = self.registry.write().await;
            registry
                .containers
                .values_mut()
                .filter_map(|record| {
                    record.cancel_monitor();
                    match record.current_state {
                        ContainerState::Stopped | ContainerState::Terminated => None,
                        _ => Some(record.container_id.clone()),
                    }
                })
                .collect()
        };

        info!("Lifecycle shutdown: terminating {} container(s)", targets.len());

        for container_id in targets {
            let outcome = AssertUnwindSafe(self.force_terminate_container(&container_id))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Cleanup of container {} failed: {}", container_id, e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Cleanup of container {} panicked: {}", container_id, message);
                    self.emit(ContainerEvent::CleanupPanicked {
                        container_id,
                        message,
                    });
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
