#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandbox_governor::config::{LifecycleConfig, ResourceThresholds};
use sandbox_governor::docker::{ContainerInspection, ContainerLifecycleManager, ContainerRuntime};
use sandbox_governor::error::{Result, SandboxError};
use sandbox_governor::resources::ResourceMonitor;
use sandbox_governor::shared::{event_channel, ContainerEvent, EventReceiver};

pub const ID: &str = "c-123456789012";
pub const OTHER_ID: &str = "c-abcdefabcdef";

#[derive(Default)]
struct FakeContainer {
    running: bool,
    health: Option<String>,
    usage: Option<String>,
}

/// In-memory runtime whose behaviour each test scripts.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    calls: Mutex<Vec<String>>,
    panic_on_kill: Mutex<HashSet<String>>,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub hang_stop: AtomicBool,
    pub fail_kill: AtomicBool,
    pub hang_removal: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_running(&self, id: &str) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                running: true,
                ..Default::default()
            },
        );
    }

    pub fn set_running(&self, id: &str, running: bool) {
        self.containers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .running = running;
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn set_health(&self, id: &str, health: Option<&str>) {
        self.containers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .health = health.map(str::to_string);
    }

    pub fn set_usage(&self, id: &str, line: &str) {
        self.containers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .usage = Some(line.to_string());
    }

    pub fn panic_on_kill(&self, id: &str) {
        self.panic_on_kill.lock().unwrap().insert(id.to_string());
    }

    pub fn set(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    fn record(&self, operation: &str, id: &str) {
        self.calls.lock().unwrap().push(format!("{operation}:{id}"));
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, container_id: &str) -> Result<()> {
        self.record("start", container_id);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandboxError::runtime("start", container_id, "image missing"));
        }
        self.set_running(container_id, true);
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace_period: Duration) -> Result<()> {
        self.record("stop", container_id);
        if self.hang_stop.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(SandboxError::runtime("stop", container_id, "daemon refused"));
        }
        self.set_running(container_id, false);
        Ok(())
    }

    async fn kill(&self, container_id: &str, _signal: &str) -> Result<()> {
        self.record("kill", container_id);
        if self.panic_on_kill.lock().unwrap().contains(container_id) {
            panic!("kill exploded for {container_id}");
        }
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(SandboxError::runtime("kill", container_id, "permission denied"));
        }
        self.set_running(container_id, false);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection> {
        self.record("inspect", container_id);
        let containers = self.containers.lock().unwrap();
        containers
            .get(container_id)
            .map(|c| ContainerInspection {
                running: c.running,
                health_status: c.health.clone(),
            })
            .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))
    }

    async fn wait_for_removal(&self, container_id: &str) -> Result<()> {
        self.record("wait", container_id);
        if self.hang_removal.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    async fn usage_snapshot(&self, container_id: &str) -> Result<String> {
        let usage = self
            .containers
            .lock()
            .unwrap()
            .get(container_id)
            .and_then(|c| c.usage.clone());
        usage.ok_or_else(|| SandboxError::runtime("stats", container_id, "no stats available"))
    }
}

pub fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        health_check_interval: Duration::from_millis(50),
        graceful_stop_timeout: Duration::from_millis(200),
        stop_grace_period: Duration::from_millis(100),
        force_kill_timeout: Duration::from_millis(200),
        removal_wait_timeout: Duration::from_millis(100),
        runtime_call_timeout: Duration::from_millis(200),
        recovery_poll_interval: Duration::from_millis(20),
        enable_failure_recovery: true,
    }
}

pub fn fast_thresholds() -> ResourceThresholds {
    ResourceThresholds {
        monitor_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn lifecycle_with(
    runtime: &Arc<FakeRuntime>,
    config: LifecycleConfig,
) -> (ContainerLifecycleManager, EventReceiver) {
    let (events, receiver) = event_channel();
    let runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    (ContainerLifecycleManager::new(runtime, config, events), receiver)
}

pub fn lifecycle(runtime: &Arc<FakeRuntime>) -> (ContainerLifecycleManager, EventReceiver) {
    lifecycle_with(runtime, fast_config())
}

pub fn resource_monitor(
    runtime: &Arc<FakeRuntime>,
    lifecycle: &ContainerLifecycleManager,
    thresholds: ResourceThresholds,
) -> (ResourceMonitor, EventReceiver) {
    let (events, receiver) = event_channel();
    let runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let monitor = ResourceMonitor::new(runtime, lifecycle.clone(), thresholds, events).unwrap();
    (monitor, receiver)
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn drain(receiver: &mut EventReceiver) -> Vec<ContainerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
