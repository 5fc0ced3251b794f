use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::usage::{parse_usage_line, ResourceUsage};
use super::violation::{classify, EnforcementAction, ResourceViolation};
use crate::config::ResourceThresholds;
use crate::docker::{bounded, validate_container_id, ContainerLifecycleManager, ContainerRuntime};
use crate::error::{Result, SandboxError};
use crate::shared::events::{ContainerEvent, EventSender};

const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const USAGE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Live bookkeeping for one container's sampling task.
struct MonitorSession {
    started_at: DateTime<Utc>,
    start_instant: Instant,
    last_usage: Option<ResourceUsage>,
    violation_count: u64,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

struct SessionRegistry {
    sessions: HashMap<String, MonitorSession>,
    total_violations: u64,
    terminated_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSessionStats {
    pub container_id: String,
    pub started_at: DateTime<Utc>,
    pub last_usage: Option<ResourceUsage>,
    pub violation_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatistics {
    pub total_violations: u64,
    pub terminated_count: u64,
    pub thresholds: ResourceThresholds,
    pub active_sessions: usize,
    pub last_usage: HashMap<String, ResourceUsage>,
}

/// Samples resource usage of monitored containers and enforces the thresholds
/// through the lifecycle manager.
#[derive(Clone)]
pub struct ResourceMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: ContainerLifecycleManager,
    thresholds: Arc<RwLock<ResourceThresholds>>,
    registry: Arc<RwLock<SessionRegistry>>,
    event_sender: EventSender,
}

impl ResourceMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: ContainerLifecycleManager,
        thresholds: ResourceThresholds,
        event_sender: EventSender,
    ) -> Result<Self> {
        thresholds.validate()?;

        Ok(Self {
            runtime,
            lifecycle,
            thresholds: Arc::new(RwLock::new(thresholds)),
            registry: Arc::new(RwLock::new(SessionRegistry {
                sessions: HashMap::new(),
                total_violations: 0,
                terminated_count: 0,
            })),
            event_sender,
        })
    }

    fn emit(&self, event: ContainerEvent) {
        let _ = self.event_sender.send(event);
    }

    pub async fn start_monitoring(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;

        let mut registry = self.registry.write().await;
        if registry.sessions.contains_key(container_id) {
            return Err(SandboxError::AlreadyMonitored(container_id.to_string()));
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let monitor = self.clone();
        let id = container_id.to_string();
        let task = tokio::spawn(async move {
            monitor.sampling_loop(id, cancel_rx).await;
        });

        registry.sessions.insert(
            container_id.to_string(),
            MonitorSession {
                started_at: Utc::now(),
                start_instant: Instant::now(),
                last_usage: None,
                violation_count: 0,
                cancel,
                task: Some(task),
            },
        );

        info!("Started resource monitoring for container {}", container_id);
        Ok(())
    }

    /// Cancels the session and waits a bounded time for its task. The session is
    /// dropped even when the task does not acknowledge in time.
    pub async fn stop_monitoring(&self, container_id: &str) -> Result<()> {
        let session = {
            let mut registry = self.registry.write().await;
            registry
                .sessions
                .remove(container_id)
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?
        };

        let _ = session.cancel.send(true);

        if let Some(task) = session.task {
            match tokio::time::timeout(SESSION_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => info!("Stopped resource monitoring for container {}", container_id),
                Ok(Err(e)) => {
                    error!("Resource sampler for container {} panicked: {}", container_id, e)
                }
                Err(_) => warn!(
                    "Resource sampler for container {} did not stop within {:?}",
                    container_id, SESSION_STOP_TIMEOUT
                ),
            }
        }
        Ok(())
    }

    async fn sampling_loop(self, container_id: String, mut cancel: watch::Receiver<bool>) {
        loop {
            // Re-read so threshold updates apply to running sessions
            let period = self.thresholds.read().await.monitor_interval;

            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = sleep(period) => {
                    if self.sample_tick(&container_id).await {
                        info!(
                            "Container {} was terminated, ending resource sampling",
                            container_id
                        );
                        break;
                    }
                }
            }
        }
        debug!("Resource sampler for container {} exited", container_id);
    }

    /// Runs one sample-classify-enforce cycle. Returns true once the container has been
    /// taken down, or when its session is gone.
    async fn sample_tick(&self, container_id: &str) -> bool {
        let usage = match self.collect_usage(container_id).await {
            Ok(usage) => usage,
            Err(SandboxError::NotFound(_)) => return true,
            Err(e) => {
                warn!("Failed to collect resource usage for container {}: {}", container_id, e);
                return false;
            }
        };

        let thresholds = self.thresholds.read().await.clone();
        let violations = classify(&usage, &thresholds);

        {
            let mut registry = self.registry.write().await;
            let count = violations.len() as u64;
            let Some(session) = registry.sessions.get_mut(container_id) else {
                return true;
            };
            session.last_usage = Some(usage);
            session.violation_count += count;
            registry.total_violations += count;
        }

        if violations.is_empty() {
            return false;
        }
        self.enforce(container_id, violations).await
    }

    async fn collect_usage(&self, container_id: &str) -> Result<ResourceUsage> {
        let elapsed = {
            let registry = self.registry.read().await;
            registry
                .sessions
                .get(container_id)
                .map(|session| session.start_instant.elapsed())
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?
        };

        let line = bounded(
            "stats",
            container_id,
            USAGE_CALL_TIMEOUT,
            self.runtime.usage_snapshot(container_id),
        )
        .await?;

        parse_usage_line(container_id, &line, elapsed)
    }

    /// Dispatches violations strongest action first; once one terminating action has
    /// succeeded the remaining ones are only logged.
    async fn enforce(&self, container_id: &str, mut violations: Vec<ResourceViolation>) -> bool {
        violations.sort_by(|a, b| b.action.cmp(&a.action));
        let mut terminated = false;

        for violation in violations {
            self.emit(ContainerEvent::ViolationDetected {
                violation: violation.clone(),
            });

            match violation.action {
                EnforcementAction::LogWarning => warn!(
                    "Resource warning for container {}: {:?} observed {:.2}, threshold {:.2}",
                    container_id, violation.violation_type, violation.observed, violation.threshold
                ),
                action if terminated => debug!(
                    "Container {} already taken down, not repeating {} for {:?}",
                    container_id, action, violation.violation_type
                ),
                action => {
                    warn!(
                        "Enforcing {} on container {}: {:?} observed {:.2}, threshold {:.2}",
                        action,
                        container_id,
                        violation.violation_type,
                        violation.observed,
                        violation.threshold
                    );

                    let result = match action {
                        EnforcementAction::ForceTerminateContainer => {
                            self.lifecycle.force_terminate_container(container_id).await
                        }
                        _ => self.lifecycle.graceful_stop_container(container_id).await,
                    };

                    match result {
                        Ok(()) => {
                            terminated = true;
                            self.registry.write().await.terminated_count += 1;
                        }
                        Err(e) => {
                            error!(
                                "Failed to enforce {} on container {}: {}",
                                action, container_id, e
                            );
                            self.emit(ContainerEvent::EnforcementFailed {
                                container_id: container_id.to_string(),
                                action,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        terminated
    }

    /// Replaces the thresholds after validating them; on error nothing changes.
    pub async fn set_resource_thresholds(&self, thresholds: ResourceThresholds) -> Result<()> {
        thresholds.validate()?;
        *self.thresholds.write().await = thresholds;
        info!("Resource thresholds updated");
        Ok(())
    }

    pub async fn resource_thresholds(&self) -> ResourceThresholds {
        self.thresholds.read().await.clone()
    }

    pub async fn get_session_stats(&self, container_id: &str) -> Option<MonitorSessionStats> {
        let registry = self.registry.read().await;
        registry
            .sessions
            .get(container_id)
            .map(|session| MonitorSessionStats {
                container_id: container_id.to_string(),
                started_at: session.started_at,
                last_usage: session.last_usage.clone(),
                violation_count: session.violation_count,
            })
    }

    pub async fn get_resource_statistics(&self) -> ResourceStatistics {
        let thresholds = self.resource_thresholds().await;
        let registry = self.registry.read().await;

        ResourceStatistics {
            total_violations: registry.total_violations,
            terminated_count: registry.terminated_count,
            thresholds,
            active_sessions: registry.sessions.len(),
            last_usage: registry
                .sessions
                .iter()
                .filter_map(|(id, session)| {
                    session.last_usage.clone().map(|usage| (id.clone(), usage))
                })
                .collect(),
        }
    }

    /// Stops every session; used on process exit.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let registry = self.registry.read().await;
            registry.sessions.keys().cloned().collect()
        };

        for container_id in ids {
            if let Err(e) = self.stop_monitoring(&container_id).await {
                debug!("Session for container {} already gone: {}", container_id, e);
            }
        }
    }
}
