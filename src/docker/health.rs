//! Health monitoring and recovery for registered containers.
//!
//! Each monitored container gets one background task that inspects it every
//! `health_check_interval`. A failed check hands the container to the recovery
//! controller inline, so a single task never runs two recoveries at once.

use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::container::ContainerState;
use super::lifecycle::{bounded, counters, validate_container_id, ContainerLifecycleManager};
use crate::error::{Result, SandboxError};
use crate::shared::events::ContainerEvent;

impl ContainerLifecycleManager {
    /// Starts the periodic health check for `container_id`. Calling it again while a
    /// monitor is active is a no-op.
    pub async fn start_health_monitoring(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;

        let (cancel, generation) = {
            let mut guard = self.registry.write().await;
            let registry = &mut *guard;
            let record = registry
                .containers
                .get_mut(container_id)
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;

            if record.monitor_active {
                debug!("Health monitor already active for container {}", container_id);
                return Ok(());
            }

            registry.monitor_generations += 1;
            record.monitor_active = true;
            record.monitor_generation = registry.monitor_generations;
            (record.cancel.subscribe(), record.monitor_generation)
        };

        let manager = self.clone();
        let id = container_id.to_string();
        tokio::spawn(async move {
            manager.health_check_loop(id, cancel, generation).await;
        });

        info!(
            "Started health monitoring for container {} every {:?}",
            container_id, self.config.health_check_interval
        );
        Ok(())
    }

    pub async fn stop_health_monitoring(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;

        let mut registry = self.registry.write().await;
        let record = registry
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;

        if record.monitor_active {
            record.cancel_monitor();
            info!("Stopped health monitoring for container {}", container_id);
        }
        Ok(())
    }

    async fn health_check_loop(
        self,
        container_id: String,
        mut cancel: watch::Receiver<bool>,
        generation: u64,
    ) {
        let mut ticker = interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; checks start one interval after launch
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.health_tick(&container_id).await;
                }
            }
        }

        let mut registry = self.registry.write().await;
        if let Some(record) = registry.containers.get_mut(&container_id) {
            if record.monitor_generation == generation {
                record.monitor_active = false;
            }
        }
        debug!("Health monitor for container {} exited", container_id);
    }

    async fn health_tick(&self, container_id: &str) {
        match self.current_state(container_id).await {
            None => return,
            Some(state) if state.is_shutting_down() => {
                debug!("Skipping health check for container {} ({})", container_id, state);
                return;
            }
            Some(_) => {}
        }

        let Err(e) = self.perform_health_check(container_id).await else {
            debug!("Container {} is healthy", container_id);
            return;
        };

        warn!("Health check failed for container {}: {}", container_id, e);
        self.emit(ContainerEvent::HealthCheckFailed {
            container_id: container_id.to_string(),
            reason: e.to_string(),
        });

        if self.config.enable_failure_recovery {
            // The next tick is the retry
            if let Err(e) = self.attempt_recovery(container_id).await {
                error!("Recovery of container {} failed: {}", container_id, e);
            }
        }
    }

    /// Inspects the container once and records the outcome on its lifecycle record.
    ///
    /// A stopped container or a probe reporting `unhealthy` fails the check; a probe
    /// that is still `starting`, or no probe at all, passes.
    pub async fn perform_health_check(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;

        let inspection = bounded(
            "inspect",
            container_id,
            self.config.runtime_call_timeout,
            self.runtime.inspect(container_id),
        )
        .await;

        let outcome = match inspection {
            Ok(inspection) if !inspection.running => Err("container is not running".to_string()),
            Ok(inspection) if inspection.health_status.as_deref() == Some("unhealthy") => {
                Err("health probe reports unhealthy".to_string())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        };

        {
            let mut registry = self.registry.write().await;
            let record = registry
                .containers
                .get_mut(container_id)
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;
            record.record_health_check(outcome.is_ok());
        }

        outcome.map_err(|reason| SandboxError::HealthCheckFailed {
            container_id: container_id.to_string(),
            reason,
        })
    }

    /// One bounded attempt to bring the container back to Running.
    ///
    /// Restarts the container when it is not running, then waits up to five health
    /// intervals for a passing check. Failures are counted and returned, never retried.
    pub async fn attempt_recovery(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;

        let from = {
            let mut registry = self.registry.write().await;
            let record = registry
                .containers
                .get_mut(container_id)
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;
            record.recovery_attempts += 1;
            record.transition(ContainerState::Recovering)
        };
        self.emit(ContainerEvent::StateChanged {
            container_id: container_id.to_string(),
            from,
            to: ContainerState::Recovering,
        });

        info!("Attempting recovery of container {}", container_id);

        match self.recover(container_id).await {
            Ok(()) => {
                // A stop or kill issued while recovering takes precedence
                let resumed = self
                    .apply_transition(
                        container_id,
                        Some(ContainerState::Recovering),
                        ContainerState::Running,
                        Some(counters::recovery_successful),
                    )
                    .await?;
                if resumed {
                    info!("Container {} recovered", container_id);
                } else {
                    info!(
                        "Container {} recovered but its state changed meanwhile, leaving it as is",
                        container_id
                    );
                }
                self.emit(ContainerEvent::RecoverySucceeded {
                    container_id: container_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let marked = self
                    .apply_transition(
                        container_id,
                        Some(ContainerState::Recovering),
                        ContainerState::Failed,
                        Some(counters::recovery_failed),
                    )
                    .await;
                if let Err(mark_err) = marked {
                    warn!("Could not mark container {} as failed: {}", container_id, mark_err);
                }
                self.emit(ContainerEvent::RecoveryFailed {
                    container_id: container_id.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn recover(&self, container_id: &str) -> Result<()> {
        let inspection = bounded(
            "inspect",
            container_id,
            self.config.runtime_call_timeout,
            self.runtime.inspect(container_id),
        )
        .await?;

        if !inspection.running {
            info!("Restarting container {}", container_id);
            let started = bounded(
                "start",
                container_id,
                self.config.runtime_call_timeout,
                self.runtime.start(container_id),
            )
            .await;

            match started {
                Ok(()) => self.bump(counters::successful_start).await,
                Err(e) => {
                    self.bump(counters::failed_start).await;
                    return Err(e);
                }
            }
        }

        let limit = self.config.recovery_timeout();
        let wait_healthy = async {
            loop {
                match self.perform_health_check(container_id).await {
                    Ok(()) => return Ok(()),
                    // Unregistered mid-recovery; nothing left to wait for
                    Err(e) if e.is_not_found() => return Err(e),
                    Err(_) => sleep(self.config.recovery_poll_interval).await,
                }
            }
        };

        match tokio::time::timeout(limit, wait_healthy).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::RecoveryTimeout {
                container_id: container_id.to_string(),
                limit,
            }),
        }
    }
}
