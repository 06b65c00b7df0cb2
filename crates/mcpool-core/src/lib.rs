//! # McPool Core Library
//!
//! Domain types shared by the protocol and runtime crates.
//!
//! ## Modules
//!
//! - `domain` - Provider configs, fingerprints, tools, instance states and projections
//! - `error` - The pool error taxonomy
//! - `ports` - Outbound collaborator traits (id generation)
//! - `response` - Success/error envelopes handed to outer layers
//! - `settings` - Quotas, lifecycle and transport tuning with env overrides

pub mod domain;
pub mod error;
pub mod ports;
pub mod response;
pub mod settings;

// Re-export commonly used types
pub use domain::*;
pub use error::{PoolError, PoolResult, QuotaKind, TimeoutPhase};
pub use ports::{IdGenerator, UuidGenerator};
pub use response::ApiResponse;
pub use settings::{LifecycleSettings, PoolSettings, RegistryLimits, TransportSettings};
