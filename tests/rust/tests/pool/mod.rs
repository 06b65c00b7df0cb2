//! Pool manager integration tests
//!
//! Get-or-create dedup under concurrency, quotas, session routing and
//! release semantics, all against [`MockConnector`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use mcpool_core::{ApiResponse, ClientType, McpConfig, PoolError, QuotaKind, RegistryLimits};
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::{fixtures, MockConnector, TestPool};

fn echo_server() -> serde_json::Value {
    json!({"command": "node", "args": ["echo-server.js"]})
}

// =============================================================================
// Get-or-create
// =============================================================================

#[tokio::test]
async fn test_concurrent_requests_share_one_connect() {
    tests::init_tracing();
    let mock = Arc::new(MockConnector::stdio().with_connect_delay(Duration::from_millis(50)));
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());

    let requests = (0..16).map(|i| {
        let pool = fixture.pool.clone();
        async move {
            pool.get_or_create_instance(
                &format!("session-{}", i),
                "echo",
                McpConfig::stdio("node", ["echo-server.js"]),
                ClientType::Stdio,
                "alice",
            )
            .await
        }
    });
    let results = join_all(requests).await;

    let acquired: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(mock.connect_count(), 1);
    assert_eq!(acquired.iter().filter(|a| a.is_new).count(), 1);
    assert!(acquired.iter().all(|a| a.instance_id == acquired[0].instance_id));
    assert_eq!(fixture.registry.len(), 1);
    assert_eq!(
        fixture
            .registry
            .get_by_id(&acquired[0].instance_id)
            .unwrap()
            .session_count(),
        16
    );
}

#[tokio::test]
async fn test_concurrent_distinct_configs_connect_in_parallel() {
    let mock = Arc::new(MockConnector::stdio().with_connect_delay(Duration::from_millis(50)));
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());

    let requests = (0..4).map(|i| {
        let pool = fixture.pool.clone();
        async move {
            pool.get_or_create_instance(
                "s1",
                "svc",
                McpConfig::stdio("node", [format!("server-{}.js", i)]),
                ClientType::Stdio,
                "alice",
            )
            .await
        }
    });
    let results = join_all(requests).await;
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|a| a.is_new)));
    assert_eq!(mock.connect_count(), 4);
    assert_eq!(fixture.registry.len(), 4);
}

#[tokio::test]
async fn test_same_config_from_two_sessions() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());
    let pool = &fixture.pool;

    let first = pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "alice")
        .await
        .unwrap();
    let second = pool
        .get_or_create_from_json("s2", "echo", ClientType::Stdio, &echo_server(), "bob")
        .await
        .unwrap();

    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.instance_id, second.instance_id);
    assert_eq!(mock.connect_count(), 1);

    let detail = pool.get_instance_detail(&first.instance_id).unwrap();
    assert_eq!(detail.session_count, 2);
    // Owned by whoever created it.
    assert_eq!(detail.user_id, "alice");
    assert_eq!(pool.get_user_instances("alice").len(), 1);
    assert!(pool.get_user_instances("bob").is_empty());
}

#[tokio::test]
async fn test_client_type_mismatch_is_rejected() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());

    let err = fixture
        .pool
        .get_or_create_instance(
            "s1",
            "remote",
            McpConfig::sse("http://localhost:9000"),
            ClientType::Stdio,
            "u",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ConfigInvalid(_)));

    let err = fixture
        .pool
        .get_or_create_from_json(
            "s1",
            "remote",
            ClientType::Sse,
            &json!({"type": "stdio", "url": "http://localhost:9000"}),
            "u",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ConfigInvalid(_)));

    let err = fixture
        .pool
        .get_or_create_from_json("s1", "bad", ClientType::Stdio, &json!({"command": "node"}), "u")
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ConfigInvalid(_)));
    assert_eq!(mock.connect_count(), 0);
}

#[tokio::test]
async fn test_connect_failure_leaves_no_state() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());
    mock.fail_connects(true);

    let err = fixture
        .pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ProcessSpawn { .. }));
    assert!(fixture.registry.is_empty());

    mock.fail_connects(false);
    let acquired = fixture
        .pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();
    assert!(acquired.is_new);
    assert_eq!(mock.connect_count(), 2);
}

// =============================================================================
// Quotas
// =============================================================================

#[tokio::test]
async fn test_per_user_quota_refuses_before_connecting() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(fixtures::limits(100, 3, 10), mock.clone());

    for i in 0..3 {
        fixture
            .pool
            .get_or_create_instance(
                "s1",
                "svc",
                McpConfig::stdio("node", [format!("server-{}.js", i)]),
                ClientType::Stdio,
                "alice",
            )
            .await
            .unwrap();
    }

    let err = fixture
        .pool
        .get_or_create_instance(
            "s1",
            "svc",
            McpConfig::stdio("node", ["server-3.js"]),
            ClientType::Stdio,
            "alice",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::QuotaExceeded {
            kind: QuotaKind::User,
            limit: 3
        }
    ));
    assert_eq!(mock.connect_count(), 3);

    // Reusing an existing instance is not a new instance.
    let reused = fixture
        .pool
        .get_or_create_instance(
            "s2",
            "svc",
            McpConfig::stdio("node", ["server-0.js"]),
            ClientType::Stdio,
            "alice",
        )
        .await
        .unwrap();
    assert!(!reused.is_new);

    // Another user still has room.
    fixture
        .pool
        .get_or_create_instance(
            "s3",
            "svc",
            McpConfig::stdio("node", ["server-3.js"]),
            ClientType::Stdio,
            "bob",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_system_quota() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(fixtures::limits(2, 10, 10), mock.clone());

    for user in ["alice", "bob"] {
        fixture
            .pool
            .get_or_create_instance(
                "s1",
                "svc",
                McpConfig::stdio("node", [format!("{}.js", user)]),
                ClientType::Stdio,
                user,
            )
            .await
            .unwrap();
    }
    let err = fixture
        .pool
        .get_or_create_instance(
            "s1",
            "svc",
            McpConfig::stdio("node", ["carol.js"]),
            ClientType::Stdio,
            "carol",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::QuotaExceeded {
            kind: QuotaKind::System,
            ..
        }
    ));
}

#[tokio::test]
async fn test_session_cap_on_shared_instance() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(fixtures::limits(10, 10, 1), mock.clone());

    fixture
        .pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();
    let err = fixture
        .pool
        .get_or_create_from_json("s2", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::QuotaExceeded {
            kind: QuotaKind::Session,
            limit: 1
        }
    ));
    assert_eq!(fixture.registry.len(), 1);
}

// =============================================================================
// Tool calls
// =============================================================================

#[tokio::test]
async fn test_call_by_instance_and_by_session() {
    let mock = Arc::new(MockConnector::stdio().with_tools(&["lookup"]));
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());
    let pool = &fixture.pool;

    let acquired = pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();

    let by_id = pool
        .call_tool(&acquired.instance_id, "lookup", json!({"q": 1}))
        .await
        .unwrap();
    assert_eq!(by_id.result, json!({"tool": "lookup", "echo": {"q": 1}}));

    let by_session = pool.call_tool("s1", "lookup", json!({})).await.unwrap();
    assert_eq!(by_session.result["tool"], "lookup");

    let err = pool.call_tool("nobody", "lookup", json!({})).await.unwrap_err();
    assert!(matches!(err, PoolError::InstanceNotFound(_)));
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn test_session_call_picks_instance_offering_tool() {
    let stdio = Arc::new(MockConnector::stdio().with_tools(&["weather"]));
    let sse = Arc::new(MockConnector::new(ClientType::Sse).with_tools(&["stocks"]));
    let connectors = mcpool_runtime::ConnectorFactory::default()
        .with_connector(stdio.clone())
        .with_connector(sse.clone());
    let fixture = TestPool::new(RegistryLimits::default(), connectors);
    let pool = &fixture.pool;

    pool.get_or_create_from_json("s1", "weather", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();
    let stocks = pool
        .get_or_create_from_json(
            "s1",
            "stocks",
            ClientType::Sse,
            &json!({"url": "http://localhost:9000"}),
            "u",
        )
        .await
        .unwrap();

    pool.call_tool("s1", "stocks", json!({})).await.unwrap();
    assert_eq!(sse.call_count(), 1);
    assert_eq!(stdio.call_count(), 0);

    // Two candidates and neither advertises the tool.
    let err = pool.call_tool("s1", "unknown", json!({})).await.unwrap_err();
    assert!(matches!(err, PoolError::InstanceNotFound(_)));

    // With one candidate left, unadvertised tools are attempted anyway.
    pool.release_instance("s1", &stocks.instance_id);
    pool.call_tool("s1", "unknown", json!({})).await.unwrap();
    assert_eq!(stdio.call_count(), 1);
}

// =============================================================================
// Release, removal, shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_release_keeps_instance_until_idle() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());
    let pool = &fixture.pool;
    let idle_timeout = Duration::from_secs(300);

    let a = pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();
    pool.get_or_create_from_json("s2", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();

    assert!(pool.release_instance("s1", &a.instance_id));
    assert!(!pool.release_instance("s1", &a.instance_id));
    let detail = pool.get_instance_detail(&a.instance_id).unwrap();
    assert_eq!(detail.session_count, 1);

    tokio::time::advance(idle_timeout + Duration::from_secs(1)).await;
    assert!(fixture.registry.get_idle_instances(idle_timeout).is_empty());

    assert!(pool.release_instance("s2", &a.instance_id));
    assert!(fixture.registry.get_idle_instances(idle_timeout).is_empty());
    assert_eq!(pool.get_pool_stats().idle_instances, 1);

    tokio::time::advance(idle_timeout + Duration::from_secs(1)).await;
    let report = pool.cleanup_idle(idle_timeout).await;
    assert_eq!(report.evicted, vec![a.instance_id.clone()]);
    assert_eq!(mock.disconnect_count(), 1);
    assert!(pool.get_instance_detail(&a.instance_id).is_none());
}

#[tokio::test]
async fn test_remove_instance_disconnects() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());

    let acquired = fixture
        .pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();
    assert!(fixture.pool.remove_instance(&acquired.instance_id).await.unwrap());
    assert_eq!(mock.disconnect_count(), 1);
    assert!(fixture.registry.is_empty());

    let err = fixture
        .pool
        .call_tool(&acquired.instance_id, "echo", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InstanceNotFound(_)));

    // The fingerprint is free again.
    let again = fixture
        .pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await
        .unwrap();
    assert!(again.is_new);
    assert_ne!(again.instance_id, acquired.instance_id);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(RegistryLimits::default(), mock.clone());

    for i in 0..3 {
        fixture
            .pool
            .get_or_create_instance(
                "s1",
                "svc",
                McpConfig::stdio("node", [format!("server-{}.js", i)]),
                ClientType::Stdio,
                "u",
            )
            .await
            .unwrap();
    }
    let report = fixture.pool.shutdown().await;
    assert_eq!(report.evicted.len(), 3);
    assert_eq!(mock.disconnect_count(), 3);
    assert!(fixture.pool.get_all_instances().is_empty());
    assert_eq!(fixture.pool.get_pool_stats().total_instances, 0);
}

#[tokio::test]
async fn test_envelope_shapes() {
    let mock = Arc::new(MockConnector::stdio());
    let fixture = TestPool::with_mock(fixtures::limits(10, 10, 1), mock.clone());

    let ok = fixture
        .pool
        .get_or_create_from_json("s1", "echo", ClientType::Stdio, &echo_server(), "u")
        .await;
    let body = serde_json::to_value(ApiResponse::from_result(ok)).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["isNew"], true);
    assert_eq!(body["instanceId"], "inst-1");
    assert_eq!(body["mcp"]["name"], "echo");
    assert!(body.get("error").is_none());

    let refused = fixture
        .pool
        .get_or_create_from_json("s2", "echo", ClientType::Stdio, &echo_server(), "u")
        .await;
    let body = serde_json::to_value(ApiResponse::from_result(refused)).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "quota_exceeded");
    assert!(body.get("instanceId").is_none());
}
