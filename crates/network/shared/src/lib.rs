//! Shared networking types for the trajectory/multiplayer sync client.
//!
//! This crate hosts protocol primitives shared by every party on the wire:
//! - value: the closed, dynamically-typed value carried in frames and shared state
//! - protocol: frame/state/lock/command messages and the well-known keys
//! - token: session tokens namespacing per-peer keys
//! - messaging: length-prefixed bincode codec
//! - transport: transport traits, a codec-framed transport and the in-memory loopback
//! - config: TOML-loadable client configuration
//!
//! Keep this crate lean: it knows nothing about merge buffers, frames or replicas.

pub mod config;
pub mod messaging;
pub mod protocol;
pub mod token;
pub mod transport;
pub mod value;

/// Tracing target used for lifecycle events emitted by this crate.
pub const LOG_TARGET: &str = "network_shared";

/// Supported protocol versions.
pub const SUPPORTED_VERSIONS: &[u16] = &[1];

pub use config::{ClientSyncConfig, ConfigError};
pub use protocol::{
    ClientMessage, CommandRequest, CommandResponse, ControlMessage, FrameUpdate, ServerMessage,
    StateUpdate,
};
pub use token::SessionToken;
pub use transport::{InboundStream, MessageSink, Transport, TransportError, TransportResult};
pub use value::Value;

/// Convenience prelude for downstream crates.
pub mod prelude {
    pub use crate::protocol::{self, keys};
    pub use crate::transport::{MessageSink, Transport, TransportError, TransportResult};
    pub use crate::{SessionToken, Value};
}
