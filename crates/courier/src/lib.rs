#![forbid(unsafe_code)]

//! `mcp-courier` is a multi-server MCP (Model Context Protocol) client core.
//!
//! One [`Connection`] per server drives the JSON-RPC lifecycle: the
//! `initialize` handshake, request/response correlation over a single
//! transport, and translation of server notifications into [`ServerEvent`]s.
//! The [`Manager`] keys connections by [`ServerName`] and shares in-flight
//! connect attempts between concurrent callers; [`blocking::Client`] puts a
//! thread-blocking facade on top for embedders without an async call stack.
//!
//! Transports are pluggable through [`wire::Transport`]; the stdio
//! (child-process) transport ships in `mcp-wire`, and an HTTP transport can
//! be installed through [`TransportFactory`].
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use mcp_courier::{blocking, ClientConfig, Config, ServerConfig, ServerName};
//! use mcp_courier::wire::Request;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let servers = BTreeMap::from([(
//!     ServerName::parse("files")?,
//!     ServerConfig::stdio("mcp-files", vec!["--root".into(), "/tmp".into()]),
//! )]);
//! let config = Config::new(ClientConfig::default(), servers);
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let client = blocking::Client::new(config, runtime.handle().clone());
//! let response = client.send_request_and_wait(
//!     "files",
//!     Request::new("tools/list", None),
//!     None,
//! )?;
//! println!("{:?}", response.result());
//! client.disconnect_all()?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
mod bridge;
mod config;
mod connection;
mod error;
mod events;
mod manager;

pub use bridge::AwaitBridge;
pub use config::{
    ClientConfig, Config, InvalidServerName, ServerConfig, ServerName, TransportKind,
    MCP_PROTOCOL_VERSION,
};
pub use connection::{Connection, ConnectionStatus, ServerInfo, SessionInfo, TransportBuilder};
pub use error::{Error, Result};
pub use events::{EventSink, EventSinkError, ServerEvent};
pub use manager::{Manager, TransportFactory};

pub use mcp_wire as wire;
