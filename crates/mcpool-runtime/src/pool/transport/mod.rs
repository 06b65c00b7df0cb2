//! Transport abstraction for provider connections
//!
//! A [`TransportConnector`] owns everything protocol-specific about one
//! client type: connecting, tool discovery, calls, liveness and teardown.
//! The pool and lifecycle code only see the trait plus the opaque
//! [`McpConnection`] handle, so a new transport is a new variant and a new
//! connector registered with the [`ConnectorFactory`].

pub mod provision;
pub mod shell_env;
mod sse;
mod stdio;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcpool_core::{ClientType, McpConfig, PoolError, PoolResult, Tool, TransportSettings};
use serde_json::Value;

pub use provision::{EnvironmentProvisioner, HostProvisioner, Provisioned};
pub use sse::{SseConnector, SseHandle};
pub use stdio::{configure_child_process_platform, StdioConnector, StdioHandle};

/// Live transport handle stored on an instance.
#[derive(Clone)]
pub enum McpConnection {
    Stdio(Arc<StdioHandle>),
    Sse(Arc<SseHandle>),
}

impl McpConnection {
    pub fn client_type(&self) -> ClientType {
        match self {
            McpConnection::Stdio(_) => ClientType::Stdio,
            McpConnection::Sse(_) => ClientType::Sse,
        }
    }

    /// Short description for logs.
    pub fn description(&self) -> String {
        match self {
            McpConnection::Stdio(handle) => match handle.pid() {
                Some(pid) => format!("stdio:pid={}", pid),
                None => "stdio".to_string(),
            },
            McpConnection::Sse(handle) => format!("sse:{}", handle.base_url()),
        }
    }

    pub(crate) fn as_stdio(&self) -> PoolResult<&Arc<StdioHandle>> {
        match self {
            McpConnection::Stdio(handle) => Ok(handle),
            other => Err(PoolError::TransportUnavailable(format!(
                "stdio connector received a {} connection",
                other.client_type()
            ))),
        }
    }

    pub(crate) fn as_sse(&self) -> PoolResult<&Arc<SseHandle>> {
        match self {
            McpConnection::Sse(handle) => Ok(handle),
            other => Err(PoolError::TransportUnavailable(format!(
                "sse connector received a {} connection",
                other.client_type()
            ))),
        }
    }
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// Result of a successful connect: the handle plus the discovered tools.
#[derive(Debug, Clone)]
pub struct ConnectedSession {
    pub connection: McpConnection,
    pub tools: Vec<Tool>,
}

/// Connector for one client type.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    fn client_type(&self) -> ClientType;

    /// Start (or reach) the provider and discover its tools.
    async fn connect(&self, instance_id: &str, config: &McpConfig) -> PoolResult<ConnectedSession>;

    async fn call_tool(
        &self,
        connection: &McpConnection,
        tool_name: &str,
        params: Value,
    ) -> PoolResult<Value>;

    /// Tear the connection down. Safe to call more than once.
    async fn disconnect(&self, connection: &McpConnection) -> PoolResult<()>;

    /// Best-effort liveness probe; never errors.
    async fn check_connection(&self, connection: &McpConnection) -> bool;
}

/// Selects the connector for a client type.
#[derive(Clone, Default)]
pub struct ConnectorFactory {
    connectors: HashMap<ClientType, Arc<dyn TransportConnector>>,
}

impl ConnectorFactory {
    /// Factory with the stock stdio and SSE connectors.
    pub fn new(settings: &TransportSettings) -> Self {
        let provisioner = Arc::new(HostProvisioner::new(settings));
        Self::default()
            .with_connector(Arc::new(StdioConnector::new(settings.clone(), provisioner)))
            .with_connector(Arc::new(SseConnector::new(settings.clone())))
    }

    /// Register (or replace) the connector for its client type.
    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connectors.insert(connector.client_type(), connector);
        self
    }

    pub fn connector(&self, client_type: ClientType) -> PoolResult<Arc<dyn TransportConnector>> {
        self.connectors.get(&client_type).cloned().ok_or_else(|| {
            PoolError::config(format!("no connector registered for client type '{}'", client_type))
        })
    }
}
