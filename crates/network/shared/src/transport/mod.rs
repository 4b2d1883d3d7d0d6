//! Abstrakte Transportschicht zwischen Sync-Client und Server.
//!
//! Ein Transport liefert drei unabhängige eingehende Kanäle (Frames,
//! geteilter Zustand, Kontrollantworten) und nimmt ausgehende
//! [`ClientMessage`]s an. Der Client-Kern sieht weder Sockets noch
//! Wire-Formate, nur diese Traits.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::protocol::{ClientMessage, ControlMessage, FrameUpdate, StateUpdate};

pub mod framed;
pub mod loopback;

pub use framed::FramedTransport;
pub use loopback::{LoopbackServer, LoopbackTransport};

/// Generic transport level error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("inbound stream ended unexpectedly")]
    StreamEnded,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl TransportError {
    /// Folds a codec failure (with its whole context chain) into a transport error.
    pub fn codec(err: anyhow::Error) -> Self {
        TransportError::Codec(format!("{err:#}"))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Inbound message sequence of one topic. `None` means the server side hung up.
pub type InboundStream<T> = BoxStream<'static, TransportResult<T>>;

/// Outbound half: hands one message to the transport without blocking.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> TransportResult<()>;
}

/// A duplex connection to one server.
pub trait Transport: MessageSink + 'static {
    fn subscribe_frames(&self) -> TransportResult<InboundStream<FrameUpdate>>;

    /// The first item is the server's full dictionary, later items are deltas.
    fn subscribe_state(&self) -> TransportResult<InboundStream<StateUpdate>>;

    fn subscribe_control(&self) -> TransportResult<InboundStream<ControlMessage>>;

    /// Resolves once every message sent so far has been handed to the wire.
    fn flush(&self) -> BoxFuture<'_, TransportResult<()>>;

    /// Tears the connection down. Idempotent.
    fn close(&self);
}
