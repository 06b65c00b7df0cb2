//! Provider configuration
//!
//! A provider is either a child process spoken to over stdio or a remote
//! HTTP/SSE service. Configs arrive from outer layers as loose JSON, so
//! [`McpConfig::from_json`] does the field checking that serde alone cannot
//! express with useful messages.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::fingerprint::ConfigFingerprint;
use crate::error::{PoolError, PoolResult};

/// Injected into every stdio child so the provider can identify itself.
pub const INSTANCE_ID_ENV: &str = "MCP_INSTANCE_ID";
/// Repository URL carried by git-backed providers.
pub const REPO_URL_ENV: &str = "MCP_REPO_URL";
/// Pre-resolved repository hash carried by git-backed providers.
pub const REPO_HASH_ENV: &str = "MCP_REPO_HASH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Stdio,
    Sse,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Stdio => "stdio",
            ClientType::Sse => "sse",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(ClientType::Stdio),
            "sse" | "http" => Ok(ClientType::Sse),
            other => Err(PoolError::config(format!("unknown client type '{}'", other))),
        }
    }
}

/// A provisioning command run before the main process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl SetupCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseConfig {
    pub url: String,
}

/// Discriminated provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpConfig {
    Stdio(StdioConfig),
    Sse(SseConfig),
}

impl McpConfig {
    /// Build a stdio config from a command and its arguments.
    pub fn stdio<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        McpConfig::Stdio(StdioConfig {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            working_dir: None,
            setup: None,
        })
    }

    pub fn sse(url: impl Into<String>) -> Self {
        McpConfig::Sse(SseConfig { url: url.into() })
    }

    /// Add an environment variable (no-op for SSE configs).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let McpConfig::Stdio(cfg) = &mut self {
            cfg.env.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        if let McpConfig::Stdio(cfg) = &mut self {
            cfg.working_dir = Some(dir.into());
        }
        self
    }

    pub fn with_setup(mut self, setup: SetupCommand) -> Self {
        if let McpConfig::Stdio(cfg) = &mut self {
            cfg.setup = Some(setup);
        }
        self
    }

    /// Split a single command line (`"node server.js --port 3"`) into a stdio config.
    pub fn from_command_line(line: &str) -> PoolResult<Self> {
        let mut parts = shell_words::split(line)
            .map_err(|e| PoolError::config(format!("cannot parse command line: {}", e)))?
            .into_iter();
        let command = parts
            .next()
            .ok_or_else(|| PoolError::config("command line is empty"))?;
        Ok(McpConfig::stdio(command, parts))
    }

    /// Parse a loosely typed JSON config for the given client type.
    ///
    /// Missing `command`/`args` (stdio) or `url` (sse) yield `ConfigInvalid`.
    /// Environment values that are numbers or booleans are stringified.
    pub fn from_json(client_type: ClientType, value: &Value) -> PoolResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| PoolError::config("config must be a JSON object"))?;

        if let Some(declared) = obj.get("type").and_then(Value::as_str) {
            if declared.parse::<ClientType>()? != client_type {
                return Err(PoolError::config(format!(
                    "config type '{}' does not match client type '{}'",
                    declared, client_type
                )));
            }
        }

        let config = match client_type {
            ClientType::Stdio => {
                let command = obj
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PoolError::config("stdio config requires a `command` string"))?;
                let args = string_array(obj.get("args"))
                    .ok_or_else(|| PoolError::config("stdio config requires an `args` array"))?;

                let env = match obj.get("env") {
                    None | Some(Value::Null) => HashMap::new(),
                    Some(Value::Object(map)) => map
                        .iter()
                        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                        .collect(),
                    Some(_) => return Err(PoolError::config("`env` must be an object")),
                };

                let working_dir = obj
                    .get("workingDir")
                    .or_else(|| obj.get("working_dir"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let setup = match obj.get("setup") {
                    None | Some(Value::Null) => None,
                    Some(raw) => {
                        let command = raw
                            .get("command")
                            .and_then(Value::as_str)
                            .ok_or_else(|| PoolError::config("`setup` requires a `command` string"))?;
                        let args = string_array(raw.get("args")).unwrap_or_default();
                        Some(SetupCommand::new(command, args))
                    }
                };

                McpConfig::Stdio(StdioConfig {
                    command: command.to_string(),
                    args,
                    env,
                    working_dir,
                    setup,
                })
            }
            ClientType::Sse => {
                let url = obj
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PoolError::config("sse config requires a `url` string"))?;
                McpConfig::sse(url)
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn client_type(&self) -> ClientType {
        match self {
            McpConfig::Stdio(_) => ClientType::Stdio,
            McpConfig::Sse(_) => ClientType::Sse,
        }
    }

    /// Reject configs whose required fields are present but empty.
    pub fn validate(&self) -> PoolResult<()> {
        match self {
            McpConfig::Stdio(cfg) => {
                if cfg.command.trim().is_empty() {
                    return Err(PoolError::config("stdio `command` must not be empty"));
                }
                if let Some(setup) = &cfg.setup {
                    if setup.command.trim().is_empty() {
                        return Err(PoolError::config("setup `command` must not be empty"));
                    }
                }
            }
            McpConfig::Sse(cfg) => {
                if cfg.url.trim().is_empty() {
                    return Err(PoolError::config("sse `url` must not be empty"));
                }
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> PoolResult<ConfigFingerprint> {
        ConfigFingerprint::of(self)
    }

    pub fn as_stdio(&self) -> Option<&StdioConfig> {
        match self {
            McpConfig::Stdio(cfg) => Some(cfg),
            McpConfig::Sse(_) => None,
        }
    }

    pub fn as_sse(&self) -> Option<&SseConfig> {
        match self {
            McpConfig::Sse(cfg) => Some(cfg),
            McpConfig::Stdio(_) => None,
        }
    }
}

/// Basename of an executable path, split on both `/` and `\`.
pub fn executable_name(command: &str) -> &str {
    command
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(command)
}

fn string_array(value: Option<&Value>) -> Option<Vec<String>> {
    value?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
