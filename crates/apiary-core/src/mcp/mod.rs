//! MCP server: the hub's JSON-RPC 2.0 surface.
//!
//! The coordinator talks to the hub over newline-delimited JSON-RPC on a
//! byte-stream pair. Hub operations are exposed as tools; read-only views
//! as resources; canned instructions as prompts. Protocol violations get
//! JSON-RPC error envelopes, tool-level failures are reported in-band.

pub mod protocol;
pub mod server;
pub mod tools;

pub use protocol::{PROTOCOL_VERSION, RpcError};
pub use server::McpServer;
