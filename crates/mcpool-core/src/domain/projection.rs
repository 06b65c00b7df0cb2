//! Read-only views handed to outer layers
//!
//! These never carry process handles or transport internals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::config::{ClientType, McpConfig};
use super::instance::InstanceState;
use super::tool::Tool;

/// Public description of a provider, as returned by get-or-create.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpInfo {
    pub name: String,
    pub client_type: ClientType,
    pub tools: Vec<Tool>,
    pub status: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl McpInfo {
    pub fn new(name: &str, config: &McpConfig, tools: Vec<Tool>, status: InstanceState) -> Self {
        let (command, args, url) = match config {
            McpConfig::Stdio(cfg) => (Some(cfg.command.clone()), Some(cfg.args.clone()), None),
            McpConfig::Sse(cfg) => (None, None, Some(cfg.url.clone())),
        };
        Self {
            name: name.to_string(),
            client_type: config.client_type(),
            tools,
            status,
            command,
            args,
            url,
        }
    }
}

/// Outcome of a successful get-or-create.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquiredInstance {
    pub is_new: bool,
    pub instance_id: String,
    pub mcp: McpInfo,
}

/// Successful tool call payload.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutput {
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub instance_id: String,
    pub fingerprint: String,
    pub name: String,
    pub user_id: String,
    pub client_type: ClientType,
    pub status: InstanceState,
    pub session_count: usize,
    pub session_ids: Vec<String>,
    pub usage_count: u64,
    pub tools: Vec<Tool>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub age_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientTypeCounts {
    pub stdio: usize,
    pub sse: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub instance_count: usize,
    pub active: usize,
    pub idle: usize,
}

/// Aggregate registry counts.
///
/// `active` instances have at least one session, `idle` have none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_instances: usize,
    pub active_instances: usize,
    pub idle_instances: usize,
    pub total_sessions: usize,
    pub total_users: usize,
    pub by_client_type: ClientTypeCounts,
    pub by_state: BTreeMap<InstanceState, usize>,
    pub users: BTreeMap<String, UserStats>,
}
