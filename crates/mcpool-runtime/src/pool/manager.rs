//! Pool manager
//!
//! Orchestrates the registry and the transport connectors:
//! - get-or-create: dedup by fingerprint, quota check, connect, register
//! - tool calls routed by instance id or by session
//! - release, remove and ad hoc idle cleanup
//! - read-only projections for outer layers
//!
//! Failures never leave partial registry state: a connection that could not
//! be registered is disconnected before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpool_core::{
    AcquiredInstance, ClientType, IdGenerator, InstanceSummary, McpConfig, PoolError, PoolResult,
    PoolStats, QuotaKind, ToolCallOutput,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::instance::McpInstance;
use super::lifecycle::{evict_instances, EvictionReport, HealthProbe, InstanceTerminator};
use super::registry::{InstanceRegistry, Registration};
use super::transport::{ConnectorFactory, McpConnection, TransportConnector};

pub struct PoolManager {
    registry: Arc<InstanceRegistry>,
    connectors: ConnectorFactory,
    ids: Arc<dyn IdGenerator>,
    termination_timeout: Duration,
}

impl PoolManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        connectors: ConnectorFactory,
        ids: Arc<dyn IdGenerator>,
        termination_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connectors,
            ids,
            termination_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Return the instance for `config`, creating it if needed, and associate
    /// `session_id` with it.
    ///
    /// Concurrent calls with the same config connect once; the others wait on
    /// the fingerprint's creation lock and then join the new instance.
    pub async fn get_or_create_instance(
        &self,
        session_id: &str,
        name: &str,
        config: McpConfig,
        client_type: ClientType,
        user_id: &str,
    ) -> PoolResult<AcquiredInstance> {
        if config.client_type() != client_type {
            return Err(PoolError::config(format!(
                "config type '{}' does not match client type '{}'",
                config.client_type(),
                client_type
            )));
        }
        let fingerprint = config.fingerprint()?;

        // An instance evicted between lookup and join falls through to create.
        if let Some(existing) = self.registry.find_by_fingerprint(&fingerprint) {
            if let Some(acquired) = self.join_existing(session_id, existing)? {
                return Ok(acquired);
            }
        }

        let lock = self.registry.creation_lock(&fingerprint);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.find_by_fingerprint(&fingerprint) {
            if let Some(acquired) = self.join_existing(session_id, existing)? {
                return Ok(acquired);
            }
        }

        // Refuse before spawning anything.
        self.registry.check_quota(user_id)?;
        let connector = self.connectors.connector(client_type)?;
        let instance_id = self.ids.next_id();

        info!(
            instance_id = %instance_id,
            name,
            user_id,
            session_id,
            fingerprint = %fingerprint.short(),
            "[PoolManager] Creating instance"
        );

        let connected = connector.connect(&instance_id, &config).await.map_err(|e| {
            warn!(instance_id = %instance_id, name, error = %e, "[PoolManager] Connect failed");
            e
        })?;
        let connection = connected.connection.clone();

        let registration = match self
            .registry
            .register(&instance_id, name, config, connected, user_id)
        {
            Ok(registration) => registration,
            Err(e) => {
                discard_connection(connector.as_ref(), &connection, &instance_id).await;
                return Err(e);
            }
        };

        match registration {
            Registration::Created(instance) => {
                if !self.registry.associate_session(session_id, instance.instance_id()) {
                    self.registry.remove(instance.instance_id());
                    discard_connection(connector.as_ref(), &connection, &instance_id).await;
                    return Err(PoolError::quota(
                        QuotaKind::Session,
                        self.registry.limits().max_sessions_per_instance,
                    ));
                }
                Ok(AcquiredInstance {
                    is_new: true,
                    instance_id: instance.instance_id().to_string(),
                    mcp: instance.info(),
                })
            }
            Registration::Existing(existing) => {
                discard_connection(connector.as_ref(), &connection, &instance_id).await;
                let existing_id = existing.instance_id().to_string();
                self.join_existing(session_id, existing)?.ok_or_else(|| {
                    PoolError::TransportUnavailable(format!(
                        "instance {} was evicted while joining",
                        existing_id
                    ))
                })
            }
        }
    }

    /// [`get_or_create_instance`](Self::get_or_create_instance) from a raw JSON config.
    pub async fn get_or_create_from_json(
        &self,
        session_id: &str,
        name: &str,
        client_type: ClientType,
        config: &Value,
        user_id: &str,
    ) -> PoolResult<AcquiredInstance> {
        let config = McpConfig::from_json(client_type, config)?;
        self.get_or_create_instance(session_id, name, config, client_type, user_id)
            .await
    }

    /// Associate `session_id` with a live instance.
    ///
    /// `Ok(None)` when the instance went terminal or left the registry before
    /// the session could attach; a full instance is a session quota error.
    fn join_existing(
        &self,
        session_id: &str,
        instance: Arc<McpInstance>,
    ) -> PoolResult<Option<AcquiredInstance>> {
        if !self.registry.associate_session(session_id, instance.instance_id()) {
            let gone = instance.state().is_terminal()
                || self.registry.get_by_id(instance.instance_id()).is_none();
            if gone {
                debug!(
                    instance_id = %instance.instance_id(),
                    session_id,
                    "[PoolManager] Instance evicted before join, creating a new one"
                );
                return Ok(None);
            }
            return Err(PoolError::quota(
                QuotaKind::Session,
                self.registry.limits().max_sessions_per_instance,
            ));
        }
        debug!(
            instance_id = %instance.instance_id(),
            session_id,
            sessions = instance.session_count(),
            "[PoolManager] Reusing instance"
        );
        Ok(Some(AcquiredInstance {
            is_new: false,
            instance_id: instance.instance_id().to_string(),
            mcp: instance.info(),
        }))
    }

    /// Call a tool on an instance, addressed either by instance id or by a
    /// session id associated with it.
    pub async fn call_tool(
        &self,
        target: &str,
        tool_name: &str,
        params: Value,
    ) -> PoolResult<ToolCallOutput> {
        let instance = self.resolve_target(target, tool_name)?;
        if !instance.state().is_available() {
            return Err(PoolError::TransportUnavailable(format!(
                "instance {} is {}",
                instance.instance_id(),
                instance.state()
            )));
        }

        let connector = self.connectors.connector(instance.client_type())?;
        debug!(
            instance_id = %instance.instance_id(),
            tool = tool_name,
            "[PoolManager] Calling tool"
        );
        match connector
            .call_tool(instance.connection(), tool_name, params)
            .await
        {
            Ok(result) => {
                instance.touch();
                Ok(ToolCallOutput { result })
            }
            Err(e) => {
                warn!(
                    instance_id = %instance.instance_id(),
                    tool = tool_name,
                    error = %e,
                    "[PoolManager] Tool call failed"
                );
                Err(e)
            }
        }
    }

    fn resolve_target(&self, target: &str, tool_name: &str) -> PoolResult<Arc<McpInstance>> {
        if let Some(instance) = self.registry.get_by_id(target) {
            return Ok(instance);
        }
        let candidates = self.registry.instances_for_session(target);
        if let Some(instance) = candidates.iter().find(|i| i.has_tool(tool_name)) {
            return Ok(instance.clone());
        }
        // An instance whose discovery timed out advertises nothing but may
        // still serve the call.
        match candidates.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(PoolError::InstanceNotFound(format!(
                "no instance or session '{}' offering tool '{}'",
                target, tool_name
            ))),
        }
    }

    /// Detach a session; the instance stays up.
    pub fn release_instance(&self, session_id: &str, instance_id: &str) -> bool {
        let released = self.registry.dissociate_session(session_id, instance_id);
        if released {
            info!(session_id, instance_id, "[PoolManager] Released instance");
        }
        released
    }

    /// Disconnect and remove an instance. `Ok(false)` if it was unknown.
    pub async fn remove_instance(&self, instance_id: &str) -> PoolResult<bool> {
        let Some(instance) = self.registry.get_by_id(instance_id) else {
            return Ok(false);
        };
        info!(instance_id, "[PoolManager] Removing instance");
        evict_instances(&self.registry, self, vec![instance], self.termination_timeout).await;
        Ok(true)
    }

    /// Evict every idle instance now, the same way a lifecycle sweep does.
    pub async fn cleanup_idle(&self, idle_timeout: Duration) -> EvictionReport {
        let idle = self.registry.get_idle_instances(idle_timeout);
        if idle.is_empty() {
            return EvictionReport::default();
        }
        info!(count = idle.len(), "[PoolManager] Cleaning up idle instances");
        evict_instances(&self.registry, self, idle, self.termination_timeout).await
    }

    /// Disconnect and remove everything.
    pub async fn shutdown(&self) -> EvictionReport {
        let all = self.registry.clear();
        if all.is_empty() {
            return EvictionReport::default();
        }
        info!(count = all.len(), "[PoolManager] Shutting down all instances");
        evict_instances(&self.registry, self, all, self.termination_timeout).await
    }

    pub fn get_all_instances(&self) -> Vec<InstanceSummary> {
        self.registry.get_all_instances()
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        self.registry.get_stats()
    }

    pub fn get_instance_detail(&self, instance_id: &str) -> Option<InstanceSummary> {
        self.registry.get_by_id(instance_id).map(|i| i.summary())
    }

    pub fn get_user_instances(&self, user_id: &str) -> Vec<InstanceSummary> {
        self.registry
            .find_user_instances(user_id)
            .iter()
            .map(|i| i.summary())
            .collect()
    }
}

async fn discard_connection(
    connector: &dyn TransportConnector,
    connection: &McpConnection,
    instance_id: &str,
) {
    if let Err(e) = connector.disconnect(connection).await {
        warn!(
            instance_id,
            connection = ?connection,
            error = %e,
            "[PoolManager] Discarded connection did not shut down cleanly"
        );
    }
}

#[async_trait]
impl InstanceTerminator for PoolManager {
    async fn terminate(&self, instance: &McpInstance) -> PoolResult<()> {
        let connector = self.connectors.connector(instance.client_type())?;
        connector.disconnect(instance.connection()).await
    }
}

#[async_trait]
impl HealthProbe for PoolManager {
    async fn probe(&self, instance: &McpInstance) -> bool {
        match self.connectors.connector(instance.client_type()) {
            Ok(connector) => connector.check_connection(instance.connection()).await,
            Err(_) => false,
        }
    }
}
