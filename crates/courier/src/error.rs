//! Error taxonomy surfaced by the client core.
//!
//! Server-originated JSON-RPC errors keep their `{code, message, data}`
//! verbatim in [`Error::Request`]; everything else is client-side and never
//! reaches the wire.

use std::time::Duration;

use serde_json::Value;

use mcp_wire::{ProtocolError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Static misconfiguration (unknown server, invalid config). Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Lifecycle failure: handshake failed, transport dropped, bad state
    /// transition, cancelled. The connection is in the `Error` state.
    #[error("connection error: {0}")]
    Connection(String),
    /// Lower-layer I/O fault raised synchronously from a send.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server answered a request with a JSON-RPC error object. The
    /// connection stays usable.
    #[error("server error {code}: {message}")]
    Request {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// Malformed message or invariant violation from the peer.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A wait deadline elapsed. The awaited completion is left in place.
    #[error("timed out after {elapsed:?}: {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },
    /// Internal or misuse condition (send while not ready, dropped channel).
    #[error("client error: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The JSON-RPC error code, for server-reported failures.
    pub fn request_code(&self) -> Option<i64> {
        match self {
            Self::Request { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// One failure often has to reject many waiters (a dying connection
    /// drains its whole pending map). `std::io::Error` is not `Clone`, so
    /// fan-out copies reconstruct it from kind + text.
    pub(crate) fn clone_for_fanout(&self) -> Self {
        match self {
            Self::Configuration(message) => Self::Configuration(message.clone()),
            Self::Connection(message) => Self::Connection(message.clone()),
            Self::Transport(err) => Self::Transport(clone_transport_error(err)),
            Self::Request {
                code,
                message,
                data,
            } => Self::Request {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::Protocol(err) => Self::Protocol(err.clone()),
            Self::Timeout { operation, elapsed } => Self::Timeout {
                operation: operation.clone(),
                elapsed: *elapsed,
            },
            Self::Client(message) => Self::Client(message.clone()),
        }
    }
}

fn clone_transport_error(err: &TransportError) -> TransportError {
    match err {
        TransportError::Io(err) => {
            TransportError::Io(std::io::Error::new(err.kind(), err.to_string()))
        }
        TransportError::Spawn(err) => {
            TransportError::Spawn(std::io::Error::new(err.kind(), err.to_string()))
        }
        TransportError::Closed(reason) => TransportError::Closed(reason.clone()),
        TransportError::MessageTooLarge { limit } => {
            TransportError::MessageTooLarge { limit: *limit }
        }
        TransportError::NotConnected => TransportError::NotConnected,
        TransportError::Encode(err) => TransportError::Encode(err.clone()),
    }
}
