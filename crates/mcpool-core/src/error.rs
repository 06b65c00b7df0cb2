//! Error taxonomy for the instance pool.
//!
//! Connector and registry failures are values, not panics: every pool
//! operation returns [`PoolResult`] and outer layers turn the error into an
//! `{success:false, error}` envelope.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Which quota rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    /// Total instances across all users
    System,
    /// Instances owned by a single user
    User,
    /// Sessions attached to a single instance
    Session,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::System => write!(f, "system instance limit"),
            QuotaKind::User => write!(f, "per-user instance limit"),
            QuotaKind::Session => write!(f, "per-instance session limit"),
        }
    }
}

/// Protocol phase that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPhase {
    Discovery,
    ToolCall,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Discovery => write!(f, "tool discovery"),
            TimeoutPhase::ToolCall => write!(f, "tool call"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid MCP configuration: {0}")]
    ConfigInvalid(String),

    #[error("quota exceeded: {kind} ({limit})")]
    QuotaExceeded { kind: QuotaKind, limit: usize },

    /// Spawn or setup failure, with an optional remediation hint for the operator.
    #[error("{message}{}", .hint.as_ref().map(|h| format!(". Hint: {h}")).unwrap_or_default())]
    ProcessSpawn {
        message: String,
        hint: Option<String>,
    },

    #[error("{phase} timed out after {}ms", .elapsed.as_millis())]
    ProtocolTimeout {
        phase: TimeoutPhase,
        elapsed: Duration,
    },

    /// The peer answered with a JSON-RPC error object.
    #[error("MCP error: {0}")]
    Protocol(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("termination did not finish within {}ms", .0.as_millis())]
    TerminationTimeout(Duration),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),
}

impl PoolError {
    pub fn config(msg: impl Into<String>) -> Self {
        PoolError::ConfigInvalid(msg.into())
    }

    pub fn spawn(message: impl Into<String>, hint: Option<&str>) -> Self {
        PoolError::ProcessSpawn {
            message: message.into(),
            hint: hint.map(str::to_string),
        }
    }

    pub fn quota(kind: QuotaKind, limit: usize) -> Self {
        PoolError::QuotaExceeded { kind, limit }
    }

    pub fn timeout(phase: TimeoutPhase, elapsed: Duration) -> Self {
        PoolError::ProtocolTimeout { phase, elapsed }
    }

    /// Stable machine-readable code for envelopes and logs.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::ConfigInvalid(_) => "config_invalid",
            PoolError::QuotaExceeded { .. } => "quota_exceeded",
            PoolError::ProcessSpawn { .. } => "process_spawn",
            PoolError::ProtocolTimeout { .. } => "protocol_timeout",
            PoolError::Protocol(_) => "protocol_error",
            PoolError::MalformedResponse(_) => "malformed_response",
            PoolError::TransportUnavailable(_) => "transport_unavailable",
            PoolError::TerminationTimeout(_) => "termination_timeout",
            PoolError::InstanceNotFound(_) => "instance_not_found",
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
