//! Domain entities for the instance pool

pub mod config;
pub mod fingerprint;
pub mod instance;
pub mod projection;
pub mod tool;

pub use config::{
    executable_name, ClientType, McpConfig, SetupCommand, SseConfig, StdioConfig,
    INSTANCE_ID_ENV, REPO_HASH_ENV, REPO_URL_ENV,
};
pub use fingerprint::{clone_url, is_git_clone, ConfigFingerprint};
pub use instance::InstanceState;
pub use projection::{
    AcquiredInstance, ClientTypeCounts, InstanceSummary, McpInfo, PoolStats, ToolCallOutput,
    UserStats,
};
pub use tool::Tool;
