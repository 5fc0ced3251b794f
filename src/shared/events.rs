use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::docker::ContainerState;
use crate::resources::{EnforcementAction, ResourceViolation};

/// Audit trail entries handed to the external logging facility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContainerEvent {
    Registered {
        container_id: String,
    },
    Unregistered {
        container_id: String,
    },
    StateChanged {
        container_id: String,
        from: ContainerState,
        to: ContainerState,
    },
    HealthCheckFailed {
        container_id: String,
        reason: String,
    },
    RecoverySucceeded {
        container_id: String,
    },
    RecoveryFailed {
        container_id: String,
        reason: String,
    },
    ViolationDetected {
        violation: ResourceViolation,
    },
    EnforcementFailed {
        container_id: String,
        action: EnforcementAction,
        reason: String,
    },
    CleanupPanicked {
        container_id: String,
        message: String,
    },
}

impl ContainerEvent {
    pub fn container_id(&self) -> &str {
        match self {
            ContainerEvent::Registered { container_id }
            | ContainerEvent::Unregistered { container_id }
            | ContainerEvent::StateChanged { container_id, .. }
            | ContainerEvent::HealthCheckFailed { container_id, .. }
            | ContainerEvent::RecoverySucceeded { container_id }
            | ContainerEvent::RecoveryFailed { container_id, .. }
            | ContainerEvent::EnforcementFailed { container_id, .. }
            | ContainerEvent::CleanupPanicked { container_id, .. } => container_id,
            ContainerEvent::ViolationDetected { violation } => &violation.container_id,
        }
    }
}

/// An event stamped for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ContainerEvent,
}

impl AuditRecord {
    pub fn new(event: ContainerEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            event,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ContainerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ContainerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Drains events into the tracing log; used when no external audit sink is attached.
pub fn spawn_event_logger(mut receiver: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let record = AuditRecord::new(event);
            let line = serde_json::to_string(&record).unwrap_or_default();

            match &record.event {
                ContainerEvent::HealthCheckFailed { .. }
                | ContainerEvent::ViolationDetected { .. } => {
                    warn!(target: "audit", "{}", line);
                }
                ContainerEvent::RecoveryFailed { .. }
                | ContainerEvent::EnforcementFailed { .. }
                | ContainerEvent::CleanupPanicked { .. } => {
                    error!(target: "audit", "{}", line);
                }
                _ => info!(target: "audit", "{}", line),
            }
        }
    })
}
