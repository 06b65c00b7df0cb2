//! # McPool Runtime
//!
//! The live half of the pool: provider processes and HTTP endpoints, the
//! registry that deduplicates them, and the sweep that retires them.

pub mod pool;

pub use pool::{
    ConnectorFactory, InstanceRegistry, LifecycleManager, McpConnection, McpInstance, PoolManager,
    TransportConnector,
};
