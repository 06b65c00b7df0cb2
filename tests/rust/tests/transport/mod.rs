//! Transport integration tests
//!
//! Stdio connectors against scripted `sh` peers and the SSE connector
//! against a wiremock server.

#[cfg(unix)]
mod stdio;
