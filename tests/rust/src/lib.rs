//! Shared test utilities and fixtures for McPool integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpool_core::{IdGenerator, LifecycleSettings, RegistryLimits, TransportSettings};
use mcpool_runtime::{ConnectorFactory, InstanceRegistry, PoolManager};

pub use mocks::{MockConnector, MockProbe, MockTerminator, TerminatorMode};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ids `inst-1`, `inst-2`, ... in call order.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        format!("inst-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Pool wired to the given connectors, with sequential ids.
pub struct TestPool {
    pub registry: Arc<InstanceRegistry>,
    pub pool: Arc<PoolManager>,
}

impl TestPool {
    pub fn new(limits: RegistryLimits, connectors: ConnectorFactory) -> Self {
        let registry = Arc::new(InstanceRegistry::new(limits));
        let pool = Arc::new(PoolManager::new(
            registry.clone(),
            connectors,
            Arc::new(SequentialIdGenerator::default()),
            Duration::from_secs(1),
        ));
        Self { registry, pool }
    }

    /// Pool whose stdio and SSE connectors are the same mock.
    pub fn with_mock(limits: RegistryLimits, mock: Arc<MockConnector>) -> Self {
        let connectors = ConnectorFactory::default()
            .with_connector(mock.clone())
            .with_connector(Arc::new(mock.for_sse()));
        Self::new(limits, connectors)
    }
}

/// Test fixture utilities
pub mod fixtures {
    use super::*;

    pub fn limits(max_instances: usize, per_user: usize, per_instance: usize) -> RegistryLimits {
        RegistryLimits {
            max_instances,
            max_instances_per_user: per_user,
            max_sessions_per_instance: per_instance,
        }
    }

    /// Fast transport timings for spawning real peers.
    pub fn fast_transport() -> TransportSettings {
        TransportSettings {
            handshake_delay: Duration::from_millis(10),
            discovery_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(2),
            kill_grace: Duration::from_millis(500),
            sse_ping_timeout: Duration::from_secs(2),
            sse_discovery_timeout: Duration::from_secs(2),
            sse_call_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn lifecycle(idle: Duration, max_lifetime: Duration) -> LifecycleSettings {
        LifecycleSettings {
            check_interval: Duration::from_secs(10),
            idle_timeout: idle,
            max_lifetime,
            termination_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }
}

/// `sh` scripts standing in for stdio providers (Unix only)
pub mod peers {
    /// Answers initialize, tools/list and tools/call by id.
    /// Tools: `echo` (answers "pong"), `fail` (JSON-RPC error).
    pub const STRICT: &str = r##"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object","properties":{"text":{"type":"string"}}}},{"name":"fail","inputSchema":{}}]}}\n' "$id" ;;
    *'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"tool exploded"}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"##;

    /// Pushes a `methods` listing on startup and never answers anything.
    pub const UNSOLICITED_METHODS: &str =
        r#"printf '{"methods":[{"name":"x"}]}\n'; while IFS= read -r line; do :; done"#;

    /// Prints a log banner, then a pretty-printed listing split over lines.
    pub const NOISY_PRETTY: &str = r#"
echo "server starting on stdio"
printf '{\n  "tools": [\n    {"name": "search", "parameters": {"properties": {"q": {"type": "string"}}}}\n  ]\n}\n'
while IFS= read -r line; do :; done
"#;

    /// Reads forever, says nothing.
    pub const SILENT: &str = "while IFS= read -r line; do :; done";

    /// Dies before discovery with a message on stderr.
    pub const CRASHING: &str = "echo 'Error: Cannot find module' >&2; exit 1";
}
