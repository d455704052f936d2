#![forbid(unsafe_code)]

//! `mcp-wire` is the wire layer of the `mcp-courier` client: a JSON-RPC 2.0
//! message codec, a request id generator, and the transport seam the
//! connection engine consumes.
//!
//! Design goals:
//! - Minimal dependencies and low ceremony (`serde_json::Value` based)
//! - A narrow, object-safe [`Transport`] trait so the engine never learns
//!   what carries its bytes
//! - Bounded per-message size limits on the built-in stdio transport
//!
//! Non-goals:
//! - Implementing a JSON-RPC server
//! - Automatic reconnect (the layer above decides policy)
//! - Rich typed schemas beyond `serde_json::Value`

mod id;
mod message;
mod stdio;
mod transport;

pub use id::IdGenerator;
pub use message::{
    decode, encode, ErrorObject, Id, Message, Notification, ProtocolError, Request, Response,
    ResponsePayload, JSONRPC_VERSION,
};
pub use stdio::{StdioLimits, StdioTransport};
pub use transport::{Transport, TransportError, TransportEvent};
