//! The transport seam: a duplex, message-framed channel bound to one server.
//!
//! The connection engine consumes transports exclusively through this trait
//! and the [`TransportEvent`] stream, so the engine never learns whether
//! bytes travel over a child process, a socket, or an HTTP bridge.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{Message, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn server process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("transport closed: {0}")]
    Closed(String),
    #[error("message exceeds {limit} byte limit")]
    MessageTooLarge { limit: usize },
    #[error("transport is not connected")]
    NotConnected,
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Signals a transport emits toward the connection engine.
///
/// Contract, per connection attempt:
/// - `Message` events arrive in the order the transport received them.
/// - `Error` is non-recoverable and is always followed by `Closed`.
/// - `Closed` is emitted at most once and nothing follows it.
/// - `Stderr` is advisory (stdio transports only) and may interleave freely.
#[derive(Debug)]
pub enum TransportEvent {
    Message(Message),
    Error(TransportError),
    Closed { reason: Option<String> },
    Stderr(Vec<u8>),
}

#[async_trait]
pub trait Transport: Send {
    /// Establishes the channel. On success the transport is usable for
    /// `send` and has begun producing events.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Hands one message to the channel. Success means accepted for
    /// transmission, not delivered.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Initiates shutdown. Idempotent; a `Closed` event eventually follows
    /// (possibly before this returns).
    async fn close(&mut self);

    /// Hands the event stream to the engine. Yields `Some` exactly once,
    /// after a successful `connect`.
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}
