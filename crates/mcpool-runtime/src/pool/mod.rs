//! Instance pool
//!
//! - **InstanceRegistry**: fingerprint-keyed store with quotas and session tracking
//! - **TransportConnector**: stdio and SSE connectors behind one trait
//! - **PoolManager**: get-or-create, tool calls, release and removal
//! - **LifecycleManager**: periodic idle/expired eviction and health checks

mod instance;
mod lifecycle;
mod manager;
mod registry;
pub mod transport;

pub use instance::McpInstance;
pub use lifecycle::{
    evict_instances, CleanupReport, EvictionReport, HealthIssue, HealthProbe, HealthReport,
    InstanceTerminator, LifecycleManager, LifecycleStats, LifecycleUpdate,
};
pub use manager::PoolManager;
pub use registry::{InstanceRegistry, Registration};
pub use transport::{
    ConnectedSession, ConnectorFactory, EnvironmentProvisioner, HostProvisioner, McpConnection,
    Provisioned, SseConnector, SseHandle, StdioConnector, StdioHandle, TransportConnector,
};
