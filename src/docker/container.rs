use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Recovering,
    Failed,
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Terminating => "terminating",
            ContainerState::Terminated => "terminated",
            ContainerState::Recovering => "recovering",
            ContainerState::Failed => "failed",
            ContainerState::Unknown => "unknown",
        }
    }

    /// States entered on purpose by a stop or kill; health failures here are expected.
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self,
            ContainerState::Stopping
                | ContainerState::Stopped
                | ContainerState::Terminating
                | ContainerState::Terminated
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Authoritative record for one sandboxed container.
#[derive(Debug)]
pub struct ContainerLifecycle {
    pub container_id: String,
    pub current_state: ContainerState,
    pub previous_state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub last_failure: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub health_status: HealthStatus,
    pub consecutive_health_failures: u32,
    pub health_check_count: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub monitor_active: bool,
    /// Manager-wide unique tag of the current monitor, so a stale task never clears a
    /// newer monitor's flag.
    pub(crate) monitor_generation: u64,
    pub(crate) cancel: watch::Sender<bool>,
    pub metadata: serde_json::Value,
}

impl ContainerLifecycle {
    pub fn new(container_id: impl Into<String>, metadata: serde_json::Value) -> Self {
        let now = Utc::now();
        let (cancel, _) = watch::channel(false);

        Self {
            container_id: container_id.into(),
            current_state: ContainerState::Creating,
            previous_state: ContainerState::Creating,
            created_at: now,
            started_at: None,
            stopped_at: None,
            terminated_at: None,
            last_state_change: now,
            last_failure: None,
            failure_count: 0,
            recovery_attempts: 0,
            health_status: HealthStatus::Unknown,
            consecutive_health_failures: 0,
            health_check_count: 0,
            last_health_check: None,
            monitor_active: false,
            monitor_generation: 0,
            cancel,
            metadata,
        }
    }

    pub(crate) fn transition(&mut self, new_state: ContainerState) -> ContainerState {
        let now = Utc::now();
        let from = self.current_state;

        self.previous_state = from;
        self.current_state = new_state;
        self.last_state_change = now;

        match new_state {
            ContainerState::Running => self.started_at = Some(now),
            ContainerState::Stopped => self.stopped_at = Some(now),
            ContainerState::Terminated => self.terminated_at = Some(now),
            ContainerState::Failed => {
                self.last_failure = Some(now);
                self.failure_count += 1;
            }
            _ => {}
        }

        from
    }

    pub(crate) fn record_health_check(&mut self, healthy: bool) {
        self.health_check_count += 1;
        self.last_health_check = Some(Utc::now());
        if healthy {
            self.health_status = HealthStatus::Healthy;
            self.consecutive_health_failures = 0;
        } else {
            self.health_status = HealthStatus::Unhealthy;
            self.consecutive_health_failures += 1;
        }
    }

    /// Fires the current cancellation signal and arms a fresh one for the next monitor.
    pub(crate) fn cancel_monitor(&mut self) {
        let _ = self.cancel.send(true);
        let (cancel, _) = watch::channel(false);
        self.cancel = cancel;
        self.monitor_active = false;
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            container_id: self.container_id.clone(),
            current_state: self.current_state,
            previous_state: self.previous_state,
            created_at: self.created_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            terminated_at: self.terminated_at,
            last_state_change: self.last_state_change,
            failure_count: self.failure_count,
            recovery_attempts: self.recovery_attempts,
            health_status: self.health_status,
            consecutive_health_failures: self.consecutive_health_failures,
            health_check_count: self.health_check_count,
            monitor_active: self.monitor_active,
        }
    }
}

/// Read-only snapshot of one lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub current_state: ContainerState,
    pub previous_state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub health_status: HealthStatus,
    pub consecutive_health_failures: u32,
    pub health_check_count: u64,
    pub monitor_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerCounters {
    pub successful_starts: u64,
    pub failed_starts: u64,
    pub successful_stops: u64,
    pub failed_stops: u64,
    pub recovery_successful: u64,
    pub recovery_failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub total_containers: usize,
    pub successful_starts: u64,
    pub failed_starts: u64,
    pub successful_stops: u64,
    pub failed_stops: u64,
    pub recovery_successful: u64,
    pub recovery_failed: u64,
    pub active_health_monitors: usize,
}
