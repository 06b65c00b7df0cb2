//! Pool settings
//!
//! Defaults match the production deployment; every value can be overridden
//! from the environment (see [`PoolSettings::from_env`]). Durations in the
//! environment are milliseconds.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

const DEFAULT_ALLOWED_EXECUTABLES: &[&str] = &[
    "node", "npm", "npx", "python", "python3", "docker", "uvx", "pip", "pip3", "git", "sh",
    "bash", "python3.8", "python3.9", "python3.10", "python3.11", "python3.12", "python3.13",
];

const DEFAULT_COMPAT_TOOLS: &[&str] = &["market-trending", "stock-quote"];

/// Registry quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryLimits {
    pub max_instances: usize,
    pub max_instances_per_user: usize,
    pub max_sessions_per_instance: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_instances: 1000,
            max_instances_per_user: 20,
            max_sessions_per_instance: 100,
        }
    }
}

/// Eviction sweep tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSettings {
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
    /// Upper bound on a single termination callback
    #[serde(with = "duration_ms")]
    pub termination_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,
    pub auto_cleanup: bool,
    pub auto_terminate_unhealthy: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
            max_lifetime: Duration::from_secs(24 * 60 * 60),
            termination_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(5),
            auto_cleanup: true,
            auto_terminate_unhealthy: false,
        }
    }
}

/// Connector tuning shared by the stdio and SSE connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSettings {
    /// Executable basenames the stdio connector may launch (plus any `*.js`)
    pub allowed_executables: Vec<String>,
    /// Tool names whose replies are accepted even when the id does not match
    pub compat_tool_names: Vec<String>,
    /// Pause before sending `initialize`, giving chatty peers a chance to advertise first
    #[serde(with = "duration_ms")]
    pub handshake_delay: Duration,
    #[serde(with = "duration_ms")]
    pub discovery_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    #[serde(with = "duration_ms")]
    pub kill_grace: Duration,
    #[serde(with = "duration_ms")]
    pub setup_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub sse_ping_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub sse_discovery_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub sse_call_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub repos_dir: PathBuf,
    pub venvs_dir: PathBuf,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let base = data_dir();
        Self {
            allowed_executables: DEFAULT_ALLOWED_EXECUTABLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            compat_tool_names: DEFAULT_COMPAT_TOOLS.iter().map(|s| s.to_string()).collect(),
            handshake_delay: Duration::from_millis(500),
            discovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(180),
            kill_grace: Duration::from_secs(2),
            setup_timeout: Duration::from_secs(300),
            sse_ping_timeout: Duration::from_secs(5),
            sse_discovery_timeout: Duration::from_secs(8),
            sse_call_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            repos_dir: base.join("repos"),
            venvs_dir: base.join("venvs"),
        }
    }
}

/// All pool settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    pub registry: RegistryLimits,
    pub lifecycle: LifecycleSettings,
    pub transport: TransportSettings,
}

impl PoolSettings {
    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let env = EnvReader { lookup: &lookup };

        let registry = &mut settings.registry;
        env.number("MAX_INSTANCES", &mut registry.max_instances);
        env.number("MAX_INSTANCES_PER_USER", &mut registry.max_instances_per_user);
        env.number("MAX_SESSIONS_PER_INSTANCE", &mut registry.max_sessions_per_instance);

        let lifecycle = &mut settings.lifecycle;
        env.millis("LIFECYCLE_CHECK_INTERVAL", &mut lifecycle.check_interval);
        env.millis("LIFECYCLE_IDLE_TIMEOUT", &mut lifecycle.idle_timeout);
        env.millis("LIFECYCLE_MAX_LIFETIME", &mut lifecycle.max_lifetime);
        env.millis("LIFECYCLE_TERMINATION_TIMEOUT", &mut lifecycle.termination_timeout);
        if let Some(raw) = lookup("LIFECYCLE_AUTO_CLEANUP") {
            lifecycle.auto_cleanup = raw.trim() != "false";
        }
        if let Some(raw) = lookup("LIFECYCLE_HEALTH_AUTO_TERMINATE") {
            lifecycle.auto_terminate_unhealthy = raw.trim() == "true";
        }

        let transport = &mut settings.transport;
        if let Some(raw) = lookup("MCP_ALLOWED_EXECUTABLES") {
            let list: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                transport.allowed_executables = list;
            }
        }
        env.millis("MCP_DISCOVERY_TIMEOUT", &mut transport.discovery_timeout);
        env.millis("MCP_CALL_TIMEOUT", &mut transport.call_timeout);
        env.delay_millis("MCP_HANDSHAKE_DELAY", &mut transport.handshake_delay);
        if let Some(dir) = lookup("REPOS_PATH") {
            transport.repos_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("VENVS_PATH") {
            transport.venvs_dir = PathBuf::from(dir);
        }

        settings
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn number<T: FromStr>(&self, key: &str, slot: &mut T) {
        if let Some(raw) = (self.lookup)(key) {
            match raw.trim().parse() {
                Ok(value) => *slot = value,
                Err(_) => warn!(key, value = %raw, "[Settings] Ignoring unparseable value"),
            }
        }
    }

    /// A positive millisecond duration; zero is ignored.
    fn millis(&self, key: &str, slot: &mut Duration) {
        let mut ms = slot.as_millis() as u64;
        self.number(key, &mut ms);
        if ms == 0 {
            warn!(key, "[Settings] Ignoring zero duration, keeping default");
            return;
        }
        *slot = Duration::from_millis(ms);
    }

    /// A millisecond delay where zero means none.
    fn delay_millis(&self, key: &str, slot: &mut Duration) {
        let mut ms = slot.as_millis() as u64;
        self.number(key, &mut ms);
        *slot = Duration::from_millis(ms);
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcpool")
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
