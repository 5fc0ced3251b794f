mod common;

use std::time::Duration;

use common::{drain, eventually, fast_config, lifecycle, lifecycle_with, FakeRuntime, ID};
use sandbox_governor::config::LifecycleConfig;
use sandbox_governor::docker::{ContainerState, HealthStatus};
use sandbox_governor::shared::ContainerEvent;
use sandbox_governor::SandboxError;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_health_monitoring_is_idempotent() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();

    manager.start_health_monitoring(ID).await.unwrap();
    manager.start_health_monitoring(ID).await.unwrap();
    assert_eq!(manager.get_manager_stats().await.active_health_monitors, 1);

    manager.stop_health_monitoring(ID).await.unwrap();
    manager.stop_health_monitoring(ID).await.unwrap();

    let stopped = eventually(WAIT, || {
        let manager = manager.clone();
        async move { !manager.get_container_stats(ID).await.unwrap().monitor_active }
    })
    .await;
    assert!(stopped);
    assert_eq!(manager.get_manager_stats().await.active_health_monitors, 0);

    // No further checks once the task has wound down
    tokio::time::sleep(Duration::from_millis(100)).await;
    let count = manager.get_container_stats(ID).await.unwrap().health_check_count;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.get_container_stats(ID).await.unwrap().health_check_count, count);
}

#[tokio::test]
async fn test_health_monitoring_requires_registration() {
    let runtime = FakeRuntime::new();
    let (manager, _events) = lifecycle(&runtime);

    assert!(manager.start_health_monitoring(ID).await.unwrap_err().is_not_found());
    assert!(manager.stop_health_monitoring(ID).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_periodic_checks_record_health() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    runtime.set_health(ID, Some("healthy"));
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();

    manager.start_health_monitoring(ID).await.unwrap();

    let checked = eventually(WAIT, || {
        let manager = manager.clone();
        async move { manager.get_container_stats(ID).await.unwrap().health_check_count >= 2 }
    })
    .await;
    assert!(checked);

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.health_status, HealthStatus::Healthy);
    assert_eq!(stats.consecutive_health_failures, 0);
    assert_eq!(stats.recovery_attempts, 0);
    manager.stop_health_monitoring(ID).await.unwrap();
}

#[tokio::test]
async fn test_perform_health_check_outcomes() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();

    runtime.set_health(ID, Some("starting"));
    manager.perform_health_check(ID).await.unwrap();

    runtime.set_health(ID, Some("unhealthy"));
    let err = manager.perform_health_check(ID).await.unwrap_err();
    assert!(matches!(err, SandboxError::HealthCheckFailed { .. }));

    runtime.set_health(ID, None);
    runtime.set_running(ID, false);
    assert!(manager.perform_health_check(ID).await.is_err());

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.health_check_count, 3);
    assert_eq!(stats.consecutive_health_failures, 2);
    assert_eq!(stats.health_status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_recovery_restarts_stopped_container() {
    let runtime = FakeRuntime::new();
    runtime.set_running(ID, false);
    let (manager, mut events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();

    manager.attempt_recovery(ID).await.unwrap();

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.current_state, ContainerState::Running);
    assert_eq!(stats.previous_state, ContainerState::Recovering);
    assert_eq!(stats.recovery_attempts, 1);
    assert!(runtime.is_running(ID));
    assert_eq!(runtime.count("start"), 1);

    let manager_stats = manager.get_manager_stats().await;
    assert_eq!(manager_stats.successful_starts, 1);
    assert_eq!(manager_stats.recovery_successful, 1);
    assert_eq!(manager_stats.recovery_failed, 0);

    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ContainerEvent::RecoverySucceeded { .. })));
}

#[tokio::test]
async fn test_recovery_of_running_container_skips_restart() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();

    manager.attempt_recovery(ID).await.unwrap();

    assert_eq!(runtime.count("start"), 0);
    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.current_state, ContainerState::Running);
}

#[tokio::test]
async fn test_recovery_fails_when_restart_fails() {
    let runtime = FakeRuntime::new();
    runtime.set_running(ID, false);
    FakeRuntime::set(&runtime.fail_start);
    let (manager, mut events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();

    let err = manager.attempt_recovery(ID).await.unwrap_err();
    assert!(matches!(err, SandboxError::Runtime { operation: "start", .. }));

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.current_state, ContainerState::Failed);
    assert_eq!(stats.failure_count, 1);

    let manager_stats = manager.get_manager_stats().await;
    assert_eq!(manager_stats.failed_starts, 1);
    assert_eq!(manager_stats.recovery_failed, 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ContainerEvent::RecoveryFailed { .. })));
}

#[tokio::test]
async fn test_recovery_times_out_on_persistent_unhealth() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    runtime.set_health(ID, Some("unhealthy"));
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = manager.attempt_recovery(ID).await.unwrap_err();

    assert!(matches!(err, SandboxError::RecoveryTimeout { .. }));
    assert!(started.elapsed() >= manager.config().recovery_timeout());
    assert_eq!(
        manager.get_container_stats(ID).await.unwrap().current_state,
        ContainerState::Failed
    );
    assert_eq!(manager.get_manager_stats().await.recovery_failed, 1);
}

#[tokio::test]
async fn test_recovery_does_not_resurrect_terminated_container() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    runtime.set_health(ID, Some("unhealthy"));
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();

    let recovery = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.attempt_recovery(ID).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;

    manager.force_terminate_container(ID).await.unwrap();
    runtime.set_health(ID, None);
    runtime.set_running(ID, true);

    let _ = recovery.await.unwrap();
    assert_eq!(
        manager.get_container_stats(ID).await.unwrap().current_state,
        ContainerState::Terminated
    );
}

#[tokio::test]
async fn test_monitor_recovers_crashed_container() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    let (manager, mut events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();
    manager.start_health_monitoring(ID).await.unwrap();

    runtime.set_running(ID, false);

    let recovered = eventually(WAIT, || {
        let manager = manager.clone();
        async move { manager.get_manager_stats().await.recovery_successful >= 1 }
    })
    .await;
    assert!(recovered);
    assert!(runtime.is_running(ID));
    assert_eq!(
        manager.get_container_stats(ID).await.unwrap().current_state,
        ContainerState::Running
    );
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ContainerEvent::HealthCheckFailed { .. })));

    manager.stop_health_monitoring(ID).await.unwrap();
}

#[tokio::test]
async fn test_monitor_skips_checks_while_shut_down() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();
    manager.start_health_monitoring(ID).await.unwrap();

    manager.graceful_stop_container(ID).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.current_state, ContainerState::Stopped);
    assert_eq!(stats.recovery_attempts, 0);
    assert_eq!(runtime.count("start"), 0);
    manager.stop_health_monitoring(ID).await.unwrap();
}

#[tokio::test]
async fn test_disabled_recovery_only_counts_failures() {
    let runtime = FakeRuntime::new();
    runtime.set_running(ID, false);
    let config = LifecycleConfig {
        enable_failure_recovery: false,
        ..fast_config()
    };
    let (manager, _events) = lifecycle_with(&runtime, config);
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();
    manager.start_health_monitoring(ID).await.unwrap();

    let failing = eventually(WAIT, || {
        let manager = manager.clone();
        async move {
            manager
                .get_container_stats(ID)
                .await
                .unwrap()
                .consecutive_health_failures
                >= 2
        }
    })
    .await;
    assert!(failing);

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert_eq!(stats.recovery_attempts, 0);
    assert_eq!(stats.current_state, ContainerState::Running);
    assert_eq!(runtime.count("start"), 0);
    manager.stop_health_monitoring(ID).await.unwrap();
}

#[tokio::test]
async fn test_stale_monitor_keeps_hands_off_reregistered_record() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    runtime.set_health(ID, Some("unhealthy"));
    let (manager, _events) = lifecycle(&runtime);
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();
    manager.start_health_monitoring(ID).await.unwrap();

    // The first check fails at 50 ms and the old task sits in a 250 ms recovery
    tokio::time::sleep(Duration::from_millis(80)).await;
    manager.unregister_container(ID).await.unwrap();
    manager.register_container(ID, None).await.unwrap();
    manager
        .update_container_state(ID, ContainerState::Running)
        .await
        .unwrap();
    manager.start_health_monitoring(ID).await.unwrap();

    // Long enough for the old task to finish its recovery and exit
    tokio::time::sleep(Duration::from_millis(350)).await;

    let stats = manager.get_container_stats(ID).await.unwrap();
    assert!(stats.monitor_active);
    assert_eq!(manager.get_manager_stats().await.active_health_monitors, 1);
    manager.stop_health_monitoring(ID).await.unwrap();
}

#[tokio::test]
async fn test_recovery_ends_when_container_is_unregistered() {
    let runtime = FakeRuntime::new();
    runtime.add_running(ID);
    runtime.set_health(ID, Some("unhealthy"));
    let config = LifecycleConfig {
        health_check_interval: Duration::from_millis(200),
        ..fast_config()
    };
    let (manager, _events) = lifecycle_with(&runtime, config);
    manager.register_container(ID, None).await.unwrap();

    let started = tokio::time::Instant::now();
    let recovery = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.attempt_recovery(ID).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    manager.unregister_container(ID).await.unwrap();

    let err = recovery.await.unwrap().unwrap_err();
    assert!(err.is_not_found());
    assert!(started.elapsed() < manager.config().recovery_timeout() / 2);
    assert_eq!(manager.get_manager_stats().await.recovery_failed, 1);
}
