//! Stdio transport tests
//!
//! Real child processes driven through the stock connector factory.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use mcpool_core::{ClientType, McpConfig, PoolError, TransportSettings};
use mcpool_runtime::pool::transport::configure_child_process_platform;
use mcpool_runtime::pool::{HostProvisioner, StdioConnector};
use mcpool_runtime::{ConnectorFactory, McpConnection, TransportConnector};
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::{fixtures, peers, TestPool};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

fn sh(script: &str) -> McpConfig {
    McpConfig::stdio("sh", ["-c", script])
}

fn connector(settings: TransportSettings) -> StdioConnector {
    let provisioner = Arc::new(HostProvisioner::new(&settings));
    StdioConnector::new(settings, provisioner)
}

#[tokio::test]
async fn test_platform_flags_preserve_stdio_communication() {
    let mut cmd = Command::new("cat");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    configure_child_process_platform(&mut cmd);

    let mut child = cmd.spawn().expect("Failed to spawn cat");
    let mut stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();

    stdin
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1}\n")
        .await
        .unwrap();
    drop(stdin);

    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).await.unwrap();
    assert_eq!(line.trim(), "{\"jsonrpc\":\"2.0\",\"id\":1}");
    child.wait().await.unwrap();
}

#[tokio::test]
async fn test_pretty_printed_listing_after_log_banner() {
    tests::init_tracing();
    let connector = connector(fixtures::fast_transport());
    let session = connector
        .connect("inst-1", &sh(peers::NOISY_PRETTY))
        .await
        .expect("connect should succeed");

    assert_eq!(session.tools.len(), 1);
    assert_eq!(session.tools[0].name, "search");
    assert_eq!(
        session.tools[0].parameters["properties"]["q"]["type"],
        "string"
    );
    connector.disconnect(&session.connection).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_stops_process() {
    let connector = connector(fixtures::fast_transport());
    let session = connector.connect("inst-1", &sh(peers::STRICT)).await.unwrap();
    let McpConnection::Stdio(handle) = &session.connection else {
        panic!("expected a stdio connection");
    };
    assert!(handle.pid().is_some());
    assert!(connector.check_connection(&session.connection).await);

    connector.disconnect(&session.connection).await.unwrap();
    connector.disconnect(&session.connection).await.unwrap();
    assert!(!connector.check_connection(&session.connection).await);

    let err = connector
        .call_tool(&session.connection, "echo", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::TransportUnavailable(_)), "got {err:?}");
}

#[tokio::test]
async fn test_working_dir_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

    // Advertises a tool named after the file it can see in its cwd.
    let script = r#"printf '{"tools":[{"name":"%s","inputSchema":{}}]}\n' "$(ls)"; while IFS= read -r line; do :; done"#;
    let config = sh(script).with_working_dir(dir.path().to_string_lossy());

    let connector = connector(fixtures::fast_transport());
    let session = connector.connect("inst-1", &config).await.unwrap();
    assert_eq!(session.tools[0].name, "marker.txt");
    connector.disconnect(&session.connection).await.unwrap();
}

#[tokio::test]
async fn test_missing_executable_is_spawn_error() {
    let settings = TransportSettings {
        allowed_executables: vec!["definitely-not-installed-mcp".to_string()],
        ..fixtures::fast_transport()
    };
    let err = connector(settings)
        .connect(
            "inst-1",
            &McpConfig::stdio("definitely-not-installed-mcp", Vec::<String>::new()),
        )
        .await
        .unwrap_err();
    match err {
        PoolError::ProcessSpawn { hint, .. } => assert!(hint.is_some()),
        other => panic!("expected spawn error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pool_over_real_processes() {
    tests::init_tracing();
    let fixture = TestPool::new(
        fixtures::limits(10, 10, 10),
        ConnectorFactory::new(&fixtures::fast_transport()),
    );
    let pool = &fixture.pool;

    let first = pool
        .get_or_create_instance("s1", "strict", sh(peers::STRICT), ClientType::Stdio, "u")
        .await
        .unwrap();
    assert!(first.is_new);
    let names: Vec<_> = first.mcp.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "fail"]);

    let second = pool
        .get_or_create_instance("s2", "strict", sh(peers::STRICT), ClientType::Stdio, "u")
        .await
        .unwrap();
    assert!(!second.is_new);
    assert_eq!(second.instance_id, first.instance_id);

    // Addressed by session, routed to the instance offering the tool.
    let output = pool.call_tool("s2", "echo", json!({"text": "hi"})).await.unwrap();
    assert_eq!(output.result["content"][0]["text"], "pong");

    let err = pool
        .call_tool(&first.instance_id, "fail", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Protocol(_)), "got {err:?}");

    let detail = pool.get_instance_detail(&first.instance_id).unwrap();
    assert_eq!(detail.session_count, 2);
    assert!(detail.usage_count >= 3);

    assert!(pool.remove_instance(&first.instance_id).await.unwrap());
    assert!(fixture.registry.is_empty());
    assert!(!pool.remove_instance(&first.instance_id).await.unwrap());
}

#[tokio::test]
async fn test_failed_discovery_leaves_pool_empty() {
    let fixture = TestPool::new(
        fixtures::limits(10, 10, 10),
        ConnectorFactory::new(&fixtures::fast_transport()),
    );
    let err = fixture
        .pool
        .get_or_create_instance("s1", "crash", sh(peers::CRASHING), ClientType::Stdio, "u")
        .await
        .unwrap_err();
    match err {
        PoolError::ProcessSpawn { message, .. } => {
            assert!(message.contains("Cannot find module"), "message: {message}")
        }
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert!(fixture.registry.is_empty());
}

#[tokio::test]
async fn test_silent_peer_joins_pool_without_tools() {
    let settings = TransportSettings {
        discovery_timeout: Duration::from_millis(300),
        ..fixtures::fast_transport()
    };
    let fixture = TestPool::new(fixtures::limits(10, 10, 10), ConnectorFactory::new(&settings));

    let acquired = fixture
        .pool
        .get_or_create_instance("s1", "quiet", sh(peers::SILENT), ClientType::Stdio, "u")
        .await
        .unwrap();
    assert!(acquired.is_new);
    assert!(acquired.mcp.tools.is_empty());

    let report = fixture.pool.shutdown().await;
    assert_eq!(report.evicted, vec![acquired.instance_id]);
    assert!(report.failed.is_empty());
}
