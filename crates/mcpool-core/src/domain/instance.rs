//! Instance lifecycle state machine
//!
//! ```text
//! Connecting ──► Connected ──► Terminated
//!     │              │
//!     └──────────────┴───────► Failed
//! ```
//!
//! `Terminated` and `Failed` are absorbing. Idleness is not a state; it is
//! derived from session count and last use.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Connecting,
    Connected,
    Terminated,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }

    /// Whether the instance can serve calls.
    pub fn is_available(&self) -> bool {
        matches!(self, InstanceState::Connected)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Connecting, Connected) | (Connecting, Terminated) | (Connecting, Failed) => true,
            (Connected, Terminated) | (Connected, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Connecting => "connecting",
            InstanceState::Connected => "connected",
            InstanceState::Terminated => "terminated",
            InstanceState::Failed => "failed",
        };
        f.write_str(s)
    }
}
