//! Outbound ports
//!
//! Logging goes through `tracing` and timers through `tokio::time`; the only
//! collaborator that needs a seam of its own is instance id generation.

use uuid::Uuid;

/// Source of caller-visible instance ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
