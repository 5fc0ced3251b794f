use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::docker::DockerConfig;
use crate::error::{Result, SandboxError};

/// Timing knobs for the lifecycle manager, health monitor and recovery controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Deadline for the whole stop request.
    #[serde(with = "duration_secs")]
    pub graceful_stop_timeout: Duration,
    /// Grace period the runtime gives the workload before it kills it itself.
    #[serde(with = "duration_secs")]
    pub stop_grace_period: Duration,
    #[serde(with = "duration_secs")]
    pub force_kill_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub removal_wait_timeout: Duration,
    /// Deadline for inspect and start calls.
    #[serde(with = "duration_secs")]
    pub runtime_call_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub recovery_poll_interval: Duration,
    pub enable_failure_recovery: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            graceful_stop_timeout: Duration::from_secs(30),
            stop_grace_period: Duration::from_secs(10),
            force_kill_timeout: Duration::from_secs(10),
            removal_wait_timeout: Duration::from_secs(10),
            runtime_call_timeout: Duration::from_secs(10),
            recovery_poll_interval: Duration::from_secs(1),
            enable_failure_recovery: true,
        }
    }
}

impl LifecycleConfig {
    /// Upper bound on how long a recovery may wait for the container to report healthy.
    pub fn recovery_timeout(&self) -> Duration {
        self.health_check_interval * 5
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("health_check_interval", self.health_check_interval),
            ("graceful_stop_timeout", self.graceful_stop_timeout),
            ("force_kill_timeout", self.force_kill_timeout),
            ("removal_wait_timeout", self.removal_wait_timeout),
            ("runtime_call_timeout", self.runtime_call_timeout),
            ("recovery_poll_interval", self.recovery_poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SandboxError::Validation(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// Global limits applied to every resource-monitored container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_warning_threshold: f64,
    pub cpu_critical_threshold: f64,
    pub memory_warning_threshold: f64,
    pub memory_critical_threshold: f64,
    #[serde(with = "duration_secs")]
    pub max_execution_time: Duration,
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,
    pub max_process_count: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_warning_threshold: 70.0,
            cpu_critical_threshold: 90.0,
            memory_warning_threshold: 80.0,
            memory_critical_threshold: 95.0,
            max_execution_time: Duration::from_secs(30 * 60),
            monitor_interval: Duration::from_secs(5),
            max_process_count: 100,
        }
    }
}

impl ResourceThresholds {
    pub fn validate(&self) -> Result<()> {
        check_percentage("cpu_warning_threshold", self.cpu_warning_threshold)?;
        check_percentage("memory_warning_threshold", self.memory_warning_threshold)?;
        check_critical(
            "cpu_critical_threshold",
            self.cpu_critical_threshold,
            self.cpu_warning_threshold,
        )?;
        check_critical(
            "memory_critical_threshold",
            self.memory_critical_threshold,
            self.memory_warning_threshold,
        )?;

        if self.max_execution_time.is_zero() {
            return Err(SandboxError::Validation(
                "max_execution_time must be greater than zero".to_string(),
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(SandboxError::Validation(
                "monitor_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_process_count == 0 {
            return Err(SandboxError::Validation(
                "max_process_count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_percentage(name: &str, value: f64) -> Result<()> {
    // NaN fails both comparisons
    if !(value > 0.0 && value <= 100.0) {
        return Err(SandboxError::Validation(format!(
            "{name} must be in (0, 100], got {value}"
        )));
    }
    Ok(())
}

fn check_critical(name: &str, critical: f64, warning: f64) -> Result<()> {
    if !(critical > warning && critical <= 100.0) {
        return Err(SandboxError::Validation(format!(
            "{name} must exceed its warning threshold ({warning}) and be at most 100, \
             got {critical}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub docker: DockerConfig,
    pub lifecycle: LifecycleConfig,
    pub thresholds: ResourceThresholds,
    pub log_dir: String,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            docker: DockerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            thresholds: ResourceThresholds::default(),
            log_dir: "./logs".to_string(),
        }
    }
}

impl GovernorConfig {
    /// Loads the optional YAML file, applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.lifecycle.validate()?;
        self.thresholds.validate()
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(socket) = env_value::<String>("DOCKER_SOCKET")? {
            self.docker.socket_path = Some(socket);
        }
        if let Some(dir) = env_value::<String>("SANDBOX_LOG_DIR")? {
            self.log_dir = dir;
        }

        let lifecycle = &mut self.lifecycle;
        if let Some(secs) = env_value::<u64>("SANDBOX_HEALTH_CHECK_INTERVAL_SECS")? {
            lifecycle.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_value::<u64>("SANDBOX_GRACEFUL_STOP_TIMEOUT_SECS")? {
            lifecycle.graceful_stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_value::<u64>("SANDBOX_FORCE_KILL_TIMEOUT_SECS")? {
            lifecycle.force_kill_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_value::<bool>("SANDBOX_ENABLE_RECOVERY")? {
            lifecycle.enable_failure_recovery = enabled;
        }

        let thresholds = &mut self.thresholds;
        if let Some(value) = env_value::<f64>("SANDBOX_CPU_WARNING")? {
            thresholds.cpu_warning_threshold = value;
        }
        if let Some(value) = env_value::<f64>("SANDBOX_CPU_CRITICAL")? {
            thresholds.cpu_critical_threshold = value;
        }
        if let Some(value) = env_value::<f64>("SANDBOX_MEMORY_WARNING")? {
            thresholds.memory_warning_threshold = value;
        }
        if let Some(value) = env_value::<f64>("SANDBOX_MEMORY_CRITICAL")? {
            thresholds.memory_critical_threshold = value;
        }
        if let Some(secs) = env_value::<u64>("SANDBOX_MAX_EXECUTION_SECS")? {
            thresholds.max_execution_time = Duration::from_secs(secs);
        }
        if let Some(secs) = env_value::<u64>("SANDBOX_MONITOR_INTERVAL_SECS")? {
            thresholds.monitor_interval = Duration::from_secs(secs);
        }
        if let Some(count) = env_value::<u64>("SANDBOX_MAX_PROCESSES")? {
            thresholds.max_process_count = count;
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SandboxError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Serializes durations as fractional seconds.
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
