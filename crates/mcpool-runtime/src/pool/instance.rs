//! Pooled provider instance
//!
//! Identity, transport handle and discovered tools are fixed at creation.
//! Everything that changes (state, sessions, last use) sits behind one lock.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpool_core::{
    ClientType, ConfigFingerprint, InstanceState, InstanceSummary, McpConfig, McpInfo, Tool,
};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::transport::{ConnectedSession, McpConnection};

#[derive(Debug)]
struct Usage {
    state: InstanceState,
    sessions: BTreeSet<String>,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    usage_count: u64,
}

impl Usage {
    fn bump(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
        self.usage_count += 1;
    }
}

pub struct McpInstance {
    instance_id: String,
    fingerprint: ConfigFingerprint,
    name: String,
    user_id: String,
    config: McpConfig,
    connection: McpConnection,
    tools: Vec<Tool>,
    created: Instant,
    created_at: DateTime<Utc>,
    usage: RwLock<Usage>,
}

impl McpInstance {
    /// New instance in `Connecting`; the registry moves it to `Connected`.
    pub fn new(
        instance_id: impl Into<String>,
        fingerprint: ConfigFingerprint,
        name: impl Into<String>,
        user_id: impl Into<String>,
        config: McpConfig,
        session: ConnectedSession,
    ) -> Self {
        let now = Instant::now();
        let now_at = Utc::now();
        Self {
            instance_id: instance_id.into(),
            fingerprint,
            name: name.into(),
            user_id: user_id.into(),
            config,
            connection: session.connection,
            tools: session.tools,
            created: now,
            created_at: now_at,
            usage: RwLock::new(Usage {
                state: InstanceState::Connecting,
                sessions: BTreeSet::new(),
                last_used: now,
                last_used_at: now_at,
                usage_count: 0,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn fingerprint(&self) -> &ConfigFingerprint {
        &self.fingerprint
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn client_type(&self) -> ClientType {
        self.config.client_type()
    }

    pub fn connection(&self) -> &McpConnection {
        &self.connection
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn state(&self) -> InstanceState {
        self.usage.read().state
    }

    /// Apply a state change if the state machine allows it.
    pub fn transition(&self, next: InstanceState) -> bool {
        let mut usage = self.usage.write();
        if usage.state.can_transition_to(next) {
            debug!(
                instance_id = %self.instance_id,
                from = %usage.state,
                to = %next,
                "[McpInstance] State change"
            );
            usage.state = next;
            true
        } else {
            debug!(
                instance_id = %self.instance_id,
                from = %usage.state,
                to = %next,
                "[McpInstance] Ignoring illegal state change"
            );
            false
        }
    }

    pub fn session_count(&self) -> usize {
        self.usage.read().sessions.len()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.usage.read().sessions.contains(session_id)
    }

    pub fn usage_count(&self) -> u64 {
        self.usage.read().usage_count
    }

    /// Associate a session, refusing terminal instances and full ones.
    /// Re-associating a session that is already present only counts as use.
    pub fn add_session(&self, session_id: &str, max_sessions: usize) -> bool {
        let mut usage = self.usage.write();
        if usage.state.is_terminal() {
            return false;
        }
        if !usage.sessions.contains(session_id) {
            if usage.sessions.len() >= max_sessions {
                return false;
            }
            usage.sessions.insert(session_id.to_string());
        }
        usage.bump();
        true
    }

    /// Drop a session. The idle clock restarts from the release.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut usage = self.usage.write();
        let removed = usage.sessions.remove(session_id);
        if removed {
            usage.last_used = Instant::now();
            usage.last_used_at = Utc::now();
        }
        removed
    }

    pub fn touch(&self) {
        self.usage.write().bump();
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.usage.read().last_used)
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created)
    }

    /// No sessions, not terminal, and unused for longer than `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        let usage = self.usage.read();
        !usage.state.is_terminal()
            && usage.sessions.is_empty()
            && Instant::now().saturating_duration_since(usage.last_used) > idle_timeout
    }

    /// Older than `max_lifetime`, whatever its sessions. Terminal instances
    /// are already on their way out and never match.
    pub fn is_older_than(&self, max_lifetime: Duration) -> bool {
        !self.state().is_terminal() && self.age() > max_lifetime
    }

    pub fn info(&self) -> McpInfo {
        McpInfo::new(&self.name, &self.config, self.tools.clone(), self.state())
    }

    pub fn summary(&self) -> InstanceSummary {
        let usage = self.usage.read();
        let now = Instant::now();
        InstanceSummary {
            instance_id: self.instance_id.clone(),
            fingerprint: self.fingerprint.to_string(),
            name: self.name.clone(),
            user_id: self.user_id.clone(),
            client_type: self.client_type(),
            status: usage.state,
            session_count: usage.sessions.len(),
            session_ids: usage.sessions.iter().cloned().collect(),
            usage_count: usage.usage_count,
            tools: self.tools.clone(),
            created_at: self.created_at,
            last_used_at: usage.last_used_at,
            idle_ms: now.saturating_duration_since(usage.last_used).as_millis() as u64,
            age_ms: now.saturating_duration_since(self.created).as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for McpInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpInstance")
            .field("instance_id", &self.instance_id)
            .field("fingerprint", &self.fingerprint.short())
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("connection", &self.connection)
            .field("state", &self.state())
            .finish()
    }
}
