//! Lifecycle manager integration tests
//!
//! Sweeps run against a real registry with mock terminators and probes, on
//! a paused clock so idle and lifetime thresholds are crossed instantly.

use std::sync::Arc;
use std::time::Duration;

use mcpool_core::{ClientType, InstanceState, McpConfig, RegistryLimits};
use mcpool_runtime::pool::{evict_instances, LifecycleUpdate};
use mcpool_runtime::LifecycleManager;
use pretty_assertions::assert_eq;
use tests::{fixtures, MockConnector, MockProbe, MockTerminator, TestPool};

const IDLE: Duration = Duration::from_secs(300);
const LIFETIME: Duration = Duration::from_secs(3600);

/// Pool with `count` instances (`inst-1`..), each created under session `s<n>`.
async fn populated(count: usize) -> (TestPool, Arc<MockConnector>) {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());
    for i in 1..=count {
        fixture
            .pool
            .get_or_create_instance(
                &format!("s{}", i),
                "svc",
                McpConfig::stdio("node", [format!("server-{}.js", i)]),
                ClientType::Stdio,
                "u",
            )
            .await
            .unwrap();
    }
    (fixture, mock)
}

fn manager(fixture: &TestPool, terminator: Arc<MockTerminator>) -> Arc<LifecycleManager> {
    Arc::new(LifecycleManager::new(
        fixture.registry.clone(),
        terminator,
        fixtures::lifecycle(IDLE, LIFETIME),
    ))
}

// =============================================================================
// Sweeps
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_evicts_only_idle_instances() {
    tests::init_tracing();
    let (fixture, _mock) = populated(3).await;
    fixture.pool.release_instance("s1", "inst-1");
    fixture.pool.release_instance("s2", "inst-2");
    let terminator = Arc::new(MockTerminator::succeeding());
    let lifecycle = manager(&fixture, terminator.clone());

    let report = lifecycle.run_cleanup_now().await;
    assert!(report.evicted.is_empty(), "nothing idle yet");

    tokio::time::advance(IDLE + Duration::from_secs(1)).await;
    let report = lifecycle.run_cleanup_now().await;

    let mut evicted = report.evicted.clone();
    evicted.sort();
    assert_eq!(evicted, vec!["inst-1".to_string(), "inst-2".to_string()]);
    assert!(report.expired.is_empty());
    assert_eq!(terminator.terminated(), evicted);
    assert_eq!(fixture.registry.len(), 1);
    assert!(fixture.registry.get_by_id("inst-3").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_max_lifetime_evicts_busy_instances() {
    let (fixture, _mock) = populated(2).await;
    let terminator = Arc::new(MockTerminator::succeeding());
    let lifecycle = manager(&fixture, terminator.clone());

    tokio::time::advance(LIFETIME + Duration::from_secs(1)).await;
    let report = lifecycle.run_cleanup_now().await;

    assert!(report.idle.is_empty());
    assert_eq!(report.expired.len(), 2);
    assert_eq!(report.evicted.len(), 2);
    assert!(fixture.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_and_expired_instance_is_evicted_once() {
    let (fixture, _mock) = populated(1).await;
    fixture.pool.release_instance("s1", "inst-1");
    let terminator = Arc::new(MockTerminator::succeeding());
    let lifecycle = manager(&fixture, terminator.clone());

    tokio::time::advance(LIFETIME + Duration::from_secs(1)).await;
    let report = lifecycle.run_cleanup_now().await;

    assert_eq!(report.idle, vec!["inst-1".to_string()]);
    assert_eq!(report.expired, vec!["inst-1".to_string()]);
    assert_eq!(report.evicted, vec!["inst-1".to_string()]);
    assert_eq!(terminator.terminated(), vec!["inst-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_terminator_still_removes_instance() {
    let (fixture, _mock) = populated(2).await;
    fixture.pool.release_instance("s1", "inst-1");
    let terminator = Arc::new(MockTerminator::hanging());
    let lifecycle = manager(&fixture, terminator.clone());

    tokio::time::advance(IDLE + Duration::from_secs(1)).await;
    let report = lifecycle.run_cleanup_now().await;

    assert_eq!(report.evicted, vec!["inst-1".to_string()]);
    assert_eq!(report.timed_out, vec!["inst-1".to_string()]);
    assert!(fixture.registry.get_by_id("inst-1").is_none());
    assert_eq!(fixture.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_terminator_still_removes_instance() {
    let (fixture, _mock) = populated(1).await;
    fixture.pool.release_instance("s1", "inst-1");
    let terminator = Arc::new(MockTerminator::failing());
    let lifecycle = manager(&fixture, terminator.clone());

    tokio::time::advance(IDLE + Duration::from_secs(1)).await;
    let report = lifecycle.run_cleanup_now().await;

    assert_eq!(report.failed, vec!["inst-1".to_string()]);
    assert!(report.timed_out.is_empty());
    assert!(fixture.registry.is_empty());
}

#[tokio::test]
async fn test_evicted_instance_is_terminal_and_refuses_sessions() {
    let (fixture, _mock) = populated(1).await;
    let instance = fixture.registry.get_by_id("inst-1").unwrap();
    let terminator = MockTerminator::succeeding();

    let report = evict_instances(
        &fixture.registry,
        &terminator,
        vec![instance.clone()],
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(report.evicted, vec!["inst-1".to_string()]);
    assert_eq!(instance.state(), InstanceState::Terminated);
    assert!(!instance.add_session("late", 10));
}

// =============================================================================
// Timer
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timer_sweeps_periodically() {
    let (fixture, _mock) = populated(1).await;
    fixture.pool.release_instance("s1", "inst-1");
    let terminator = Arc::new(MockTerminator::succeeding());
    let lifecycle = manager(&fixture, terminator.clone());

    lifecycle.start();
    assert!(lifecycle.is_running());
    lifecycle.start();

    // First sweep is immediate and finds nothing.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(lifecycle.stats().sweeps, 1);
    assert_eq!(fixture.registry.len(), 1);

    tokio::time::sleep(IDLE + Duration::from_secs(20)).await;
    assert!(fixture.registry.is_empty());
    let stats = lifecycle.stats();
    assert!(stats.sweeps > 1);
    assert_eq!(stats.total_evicted, 1);
    assert!(stats.last_sweep_at.is_some());
    assert_eq!(stats.pool.total_instances, 0);

    lifecycle.stop();
    assert!(!lifecycle.is_running());
    lifecycle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_auto_cleanup_disabled_does_not_start() {
    let (fixture, _mock) = populated(0).await;
    let lifecycle = manager(&fixture, Arc::new(MockTerminator::succeeding()));

    lifecycle.update_config(LifecycleUpdate {
        auto_cleanup: Some(false),
        ..Default::default()
    });
    lifecycle.start();
    assert!(!lifecycle.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_update_config_restarts_running_timer() {
    let (fixture, _mock) = populated(1).await;
    fixture.pool.release_instance("s1", "inst-1");
    let lifecycle = manager(&fixture, Arc::new(MockTerminator::succeeding()));
    lifecycle.start();

    lifecycle.update_config(LifecycleUpdate {
        idle_timeout: Some(Duration::from_secs(5)),
        check_interval: Some(Duration::from_secs(1)),
        ..Default::default()
    });
    assert!(lifecycle.is_running());
    assert_eq!(lifecycle.settings().idle_timeout, Duration::from_secs(5));
    assert_eq!(lifecycle.settings().max_lifetime, LIFETIME);

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(fixture.registry.is_empty());
    lifecycle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_zero_check_interval_still_sweeps() {
    let (fixture, _mock) = populated(1).await;
    fixture.pool.release_instance("s1", "inst-1");
    let mut settings = fixtures::lifecycle(IDLE, LIFETIME);
    settings.check_interval = Duration::ZERO;
    let lifecycle = Arc::new(LifecycleManager::new(
        fixture.registry.clone(),
        Arc::new(MockTerminator::succeeding()),
        settings,
    ));

    lifecycle.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(lifecycle.is_running());
    assert_eq!(lifecycle.stats().sweeps, 1);

    lifecycle.update_config(LifecycleUpdate {
        check_interval: Some(Duration::ZERO),
        idle_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    assert_eq!(lifecycle.settings().idle_timeout, Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(lifecycle.is_running());

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert!(fixture.registry.is_empty());
    lifecycle.stop();
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_check_reports_without_terminating() {
    let (fixture, _mock) = populated(2).await;
    let probe = Arc::new(MockProbe::default());
    probe.mark_unhealthy("inst-2");
    let lifecycle = Arc::new(
        LifecycleManager::new(
            fixture.registry.clone(),
            Arc::new(MockTerminator::succeeding()),
            fixtures::lifecycle(IDLE, LIFETIME),
        )
        .with_health_probe(probe),
    );

    let report = lifecycle.perform_health_check().await;
    assert_eq!(report.total, 2);
    assert_eq!(report.healthy, 1);
    assert_eq!(report.unhealthy, 1);
    assert_eq!(report.issues[0].instance_id, "inst-2");
    assert!(report.auto_terminated.is_empty());
    assert_eq!(fixture.registry.len(), 2);
}

#[tokio::test]
async fn test_health_check_auto_terminates_through_pool() {
    let (fixture, mock) = populated(2).await;
    mock.set_unhealthy(true);
    let lifecycle = Arc::new(
        LifecycleManager::new(
            fixture.registry.clone(),
            fixture.pool.clone(),
            fixtures::lifecycle(IDLE, LIFETIME),
        )
        .with_health_probe(fixture.pool.clone()),
    );
    lifecycle.update_config(LifecycleUpdate {
        auto_terminate_unhealthy: Some(true),
        ..Default::default()
    });

    let report = lifecycle.perform_health_check().await;
    let mut terminated = report.auto_terminated.clone();
    terminated.sort();
    assert_eq!(terminated, vec!["inst-1".to_string(), "inst-2".to_string()]);
    assert_eq!(mock.disconnect_count(), 2);
    assert!(fixture.registry.is_empty());
}

#[tokio::test]
async fn test_health_check_without_probe_is_empty() {
    let (fixture, _mock) = populated(1).await;
    let lifecycle = manager(&fixture, Arc::new(MockTerminator::succeeding()));
    let report = lifecycle.perform_health_check().await;
    assert_eq!(report.total, 0);
    assert_eq!(fixture.registry.len(), 1);
}
