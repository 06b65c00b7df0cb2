//! MCP wire protocol
//!
//! Everything here is transport-agnostic and free of I/O:
//! - `protocol` - JSON-RPC 2.0 request/response shapes and request builders
//! - `framing` - "append chunk, drain frames" reassembly of a child's stdout
//! - `discovery` - recognition of the tool-listing shapes peers actually send

pub mod discovery;
pub mod framing;
pub mod protocol;

pub use discovery::extract_tool_listing;
pub use framing::{Frame, FrameBuffer};
pub use protocol::{
    ClientInfo, JsonRpcError, JsonRpcNotification, JsonRpcRequest, ResponseFrame,
    PROTOCOL_VERSION,
};
