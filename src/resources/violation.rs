use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::usage::ResourceUsage;
use crate::config::ResourceThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    CpuWarning,
    CpuCritical,
    MemoryWarning,
    MemoryCritical,
    ProcessLimit,
    ExecutionTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
    Emergency,
}

/// Ordered by escalation: a later variant supersedes an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    LogWarning,
    TerminateContainer,
    ForceTerminateContainer,
}

impl EnforcementAction {
    /// True for actions that take the container down.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnforcementAction::LogWarning)
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnforcementAction::LogWarning => "log_warning",
            EnforcementAction::TerminateContainer => "terminate_container",
            EnforcementAction::ForceTerminateContainer => "force_terminate_container",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub container_id: String,
    pub violation_type: ViolationType,
    pub threshold: f64,
    pub observed: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub action: EnforcementAction,
}

impl ResourceViolation {
    fn new(
        usage: &ResourceUsage,
        violation_type: ViolationType,
        threshold: f64,
        observed: f64,
    ) -> Self {
        let (severity, action) = match violation_type {
            ViolationType::CpuWarning | ViolationType::MemoryWarning => {
                (Severity::Warning, EnforcementAction::LogWarning)
            }
            ViolationType::CpuCritical
            | ViolationType::MemoryCritical
            | ViolationType::ProcessLimit => {
                (Severity::Critical, EnforcementAction::TerminateContainer)
            }
            ViolationType::ExecutionTimeout => {
                (Severity::Emergency, EnforcementAction::ForceTerminateContainer)
            }
        };

        Self {
            container_id: usage.container_id.clone(),
            violation_type,
            threshold,
            observed,
            severity,
            timestamp: usage.timestamp,
            action,
        }
    }
}

/// Maps one sample to every threshold it breaches. Each check is independent, so a
/// single sample can produce several violations.
pub fn classify(usage: &ResourceUsage, thresholds: &ResourceThresholds) -> Vec<ResourceViolation> {
    let mut violations = Vec::new();

    if usage.cpu_percent >= thresholds.cpu_critical_threshold {
        violations.push(ResourceViolation::new(
            usage,
            ViolationType::CpuCritical,
            thresholds.cpu_critical_threshold,
            usage.cpu_percent,
        ));
    } else if usage.cpu_percent >= thresholds.cpu_warning_threshold {
        violations.push(ResourceViolation::new(
            usage,
            ViolationType::CpuWarning,
            thresholds.cpu_warning_threshold,
            usage.cpu_percent,
        ));
    }

    if usage.memory_percent >= thresholds.memory_critical_threshold {
        violations.push(ResourceViolation::new(
            usage,
            ViolationType::MemoryCritical,
            thresholds.memory_critical_threshold,
            usage.memory_percent,
        ));
    } else if usage.memory_percent >= thresholds.memory_warning_threshold {
        violations.push(ResourceViolation::new(
            usage,
            ViolationType::MemoryWarning,
            thresholds.memory_warning_threshold,
            usage.memory_percent,
        ));
    }

    if usage.process_count > thresholds.max_process_count {
        violations.push(ResourceViolation::new(
            usage,
            ViolationType::ProcessLimit,
            thresholds.max_process_count as f64,
            usage.process_count as f64,
        ));
    }

    if usage.execution_time > thresholds.max_execution_time {
        violations.push(ResourceViolation::new(
            usage,
            ViolationType::ExecutionTimeout,
            thresholds.max_execution_time.as_secs_f64(),
            usage.execution_time.as_secs_f64(),
        ));
    }

    violations
}
