//! Instance registry
//!
//! The authoritative map from config fingerprint to live instance. One
//! `RwLock` guards the three indexes (fingerprint, id, user) so quota checks
//! and inserts happen in a single critical section. A separate per-fingerprint
//! async lock is handed to the pool manager so that only one caller spawns a
//! provider for a given config while others wait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mcpool_core::{
    ClientType, ClientTypeCounts, ConfigFingerprint, InstanceState, InstanceSummary, McpConfig,
    PoolError, PoolResult, PoolStats, QuotaKind, RegistryLimits, UserStats,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::instance::McpInstance;
use super::transport::ConnectedSession;

/// Outcome of [`InstanceRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    Created(Arc<McpInstance>),
    /// A live instance already held the fingerprint; the caller's connection
    /// was not stored and should be torn down.
    Existing(Arc<McpInstance>),
}

impl Registration {
    pub fn instance(&self) -> &Arc<McpInstance> {
        match self {
            Registration::Created(instance) | Registration::Existing(instance) => instance,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

#[derive(Default)]
struct RegistryState {
    by_fingerprint: HashMap<ConfigFingerprint, String>,
    by_id: HashMap<String, Arc<McpInstance>>,
    by_user: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn live(&self, fingerprint: &ConfigFingerprint) -> Option<Arc<McpInstance>> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|id| self.by_id.get(id))
            .filter(|instance| !instance.state().is_terminal())
            .cloned()
    }

    fn live_count(&self) -> usize {
        self.by_id
            .values()
            .filter(|i| !i.state().is_terminal())
            .count()
    }

    fn live_count_for(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, |ids| {
            ids.iter()
                .filter_map(|id| self.by_id.get(id))
                .filter(|i| !i.state().is_terminal())
                .count()
        })
    }

    fn check_quota(&self, limits: &RegistryLimits, user_id: &str) -> PoolResult<()> {
        if self.live_count() >= limits.max_instances {
            return Err(PoolError::quota(QuotaKind::System, limits.max_instances));
        }
        if self.live_count_for(user_id) >= limits.max_instances_per_user {
            return Err(PoolError::quota(QuotaKind::User, limits.max_instances_per_user));
        }
        Ok(())
    }
}

pub struct InstanceRegistry {
    limits: RegistryLimits,
    state: RwLock<RegistryState>,
    creation_locks: DashMap<ConfigFingerprint, Arc<tokio::sync::Mutex<()>>>,
}

impl InstanceRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            state: RwLock::new(RegistryState::default()),
            creation_locks: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    /// Async lock serializing creation for one fingerprint.
    pub fn creation_lock(&self, fingerprint: &ConfigFingerprint) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .entry(fingerprint.clone())
            .or_default()
            .clone()
    }

    /// Fail with `QuotaExceeded` if `user_id` could not register one more instance.
    pub fn check_quota(&self, user_id: &str) -> PoolResult<()> {
        self.state.read().check_quota(&self.limits, user_id)
    }

    /// Store a connected instance under its config fingerprint.
    ///
    /// Atomic per fingerprint: if a live instance already holds it, that one is
    /// returned as [`Registration::Existing`]. Quotas are checked in the same
    /// critical section and a violation leaves the registry untouched. A
    /// terminal instance still holding the fingerprint is superseded.
    pub fn register(
        &self,
        instance_id: &str,
        name: &str,
        config: McpConfig,
        session: ConnectedSession,
        user_id: &str,
    ) -> PoolResult<Registration> {
        let fingerprint = config.fingerprint()?;
        let mut state = self.state.write();

        if let Some(existing) = state.live(&fingerprint) {
            debug!(
                instance_id = %existing.instance_id(),
                fingerprint = %fingerprint.short(),
                "[Registry] Fingerprint already registered"
            );
            return Ok(Registration::Existing(existing));
        }
        if state.by_id.contains_key(instance_id) {
            return Err(PoolError::config(format!(
                "instance id '{}' is already in use",
                instance_id
            )));
        }
        state.check_quota(&self.limits, user_id)?;

        let instance = Arc::new(McpInstance::new(
            instance_id,
            fingerprint.clone(),
            name,
            user_id,
            config,
            session,
        ));
        instance.transition(InstanceState::Connected);

        if let Some(previous) = state.by_fingerprint.insert(fingerprint.clone(), instance_id.to_string()) {
            debug!(
                previous = %previous,
                instance_id,
                "[Registry] Superseding terminal instance"
            );
        }
        state.by_id.insert(instance_id.to_string(), instance.clone());
        state
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(instance_id.to_string());

        info!(
            instance_id,
            name,
            user_id,
            fingerprint = %fingerprint.short(),
            client_type = %instance.client_type(),
            tool_count = instance.tools().len(),
            total = state.by_id.len(),
            "[Registry] Registered instance"
        );
        Ok(Registration::Created(instance))
    }

    /// Live instance for a config, if any.
    pub fn find_matching(&self, config: &McpConfig) -> PoolResult<Option<Arc<McpInstance>>> {
        Ok(self.find_by_fingerprint(&config.fingerprint()?))
    }

    pub fn find_by_fingerprint(&self, fingerprint: &ConfigFingerprint) -> Option<Arc<McpInstance>> {
        self.state.read().live(fingerprint)
    }

    pub fn get_by_id(&self, instance_id: &str) -> Option<Arc<McpInstance>> {
        self.state.read().by_id.get(instance_id).cloned()
    }

    /// Attach a session; false if the instance is missing, terminal or full.
    pub fn associate_session(&self, session_id: &str, instance_id: &str) -> bool {
        let Some(instance) = self.get_by_id(instance_id) else {
            debug!(session_id, instance_id, "[Registry] Associate: unknown instance");
            return false;
        };
        let added = instance.add_session(session_id, self.limits.max_sessions_per_instance);
        if added {
            debug!(
                session_id,
                instance_id,
                sessions = instance.session_count(),
                "[Registry] Session associated"
            );
        } else {
            warn!(
                session_id,
                instance_id,
                sessions = instance.session_count(),
                limit = self.limits.max_sessions_per_instance,
                "[Registry] Session not associated"
            );
        }
        added
    }

    pub fn dissociate_session(&self, session_id: &str, instance_id: &str) -> bool {
        let removed = self
            .get_by_id(instance_id)
            .is_some_and(|instance| instance.remove_session(session_id));
        if removed {
            debug!(session_id, instance_id, "[Registry] Session dissociated");
        }
        removed
    }

    /// Record a use of the instance (e.g. a tool call).
    pub fn touch(&self, instance_id: &str) -> bool {
        match self.get_by_id(instance_id) {
            Some(instance) => {
                instance.touch();
                true
            }
            None => false,
        }
    }

    /// Sessionless, non-terminal instances unused for longer than `idle_timeout`.
    pub fn get_idle_instances(&self, idle_timeout: Duration) -> Vec<Arc<McpInstance>> {
        self.filtered(|instance| instance.is_idle(idle_timeout))
    }

    /// Non-terminal instances older than `max_lifetime`, sessions or not.
    pub fn get_old_instances(&self, max_lifetime: Duration) -> Vec<Arc<McpInstance>> {
        self.filtered(|instance| instance.is_older_than(max_lifetime))
    }

    /// Every instance that can currently serve calls.
    pub fn available_instances(&self) -> Vec<Arc<McpInstance>> {
        self.filtered(|instance| instance.state().is_available())
    }

    pub fn find_user_instances(&self, user_id: &str) -> Vec<Arc<McpInstance>> {
        let state = self.state.read();
        state
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Instances the session is associated with, oldest first.
    pub fn instances_for_session(&self, session_id: &str) -> Vec<Arc<McpInstance>> {
        let mut found = self.filtered(|instance| instance.has_session(session_id));
        found.sort_by_key(|instance| instance.created_at());
        found
    }

    /// Delete an instance and its index entries. Unconditional.
    pub fn remove(&self, instance_id: &str) -> bool {
        let mut state = self.state.write();
        let Some(instance) = state.by_id.remove(instance_id) else {
            return false;
        };

        let fingerprint = instance.fingerprint();
        if state.by_fingerprint.get(fingerprint).map(String::as_str) == Some(instance_id) {
            state.by_fingerprint.remove(fingerprint);
            self.creation_locks.remove(fingerprint);
        }
        if let Some(ids) = state.by_user.get_mut(instance.user_id()) {
            ids.remove(instance_id);
            if ids.is_empty() {
                state.by_user.remove(instance.user_id());
            }
        }

        info!(
            instance_id,
            user_id = %instance.user_id(),
            remaining = state.by_id.len(),
            "[Registry] Removed instance"
        );
        true
    }

    /// Drop everything, returning what was held so the caller can disconnect it.
    pub fn clear(&self) -> Vec<Arc<McpInstance>> {
        let mut state = self.state.write();
        let drained: Vec<_> = state.by_id.drain().map(|(_, instance)| instance).collect();
        state.by_fingerprint.clear();
        state.by_user.clear();
        self.creation_locks.clear();
        if !drained.is_empty() {
            info!(count = drained.len(), "[Registry] Cleared");
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all instances, oldest first.
    pub fn get_all_instances(&self) -> Vec<InstanceSummary> {
        let mut summaries: Vec<_> = self
            .state
            .read()
            .by_id
            .values()
            .map(|instance| instance.summary())
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        summaries
    }

    pub fn get_stats(&self) -> PoolStats {
        let state = self.state.read();
        let mut stats = PoolStats {
            total_instances: state.by_id.len(),
            total_users: state.by_user.len(),
            ..Default::default()
        };
        let mut by_type = ClientTypeCounts::default();
        let mut users: BTreeMap<String, UserStats> = BTreeMap::new();

        for instance in state.by_id.values() {
            let instance_state = instance.state();
            *stats.by_state.entry(instance_state).or_default() += 1;
            match instance.client_type() {
                ClientType::Stdio => by_type.stdio += 1,
                ClientType::Sse => by_type.sse += 1,
            }

            let sessions = instance.session_count();
            stats.total_sessions += sessions;
            let user = users.entry(instance.user_id().to_string()).or_default();
            user.instance_count += 1;
            if instance_state.is_terminal() {
                continue;
            }
            if sessions > 0 {
                stats.active_instances += 1;
                user.active += 1;
            } else {
                stats.idle_instances += 1;
                user.idle += 1;
            }
        }

        stats.by_client_type = by_type;
        stats.users = users;
        stats
    }

    fn filtered(&self, predicate: impl Fn(&McpInstance) -> bool) -> Vec<Arc<McpInstance>> {
        self.state
            .read()
            .by_id
            .values()
            .filter(|instance| predicate(instance))
            .cloned()
            .collect()
    }
}
