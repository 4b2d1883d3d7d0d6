//! Client-side synchronisation core.
//!
//! Background tasks read the frame, state and control streams of a
//! transport into single-slot merge buffers; everything else runs on the
//! caller's tick:
//! - merge_buffer / stream: lock-free hand-off from I/O tasks to the tick
//! - frame / trajectory: copy-on-write frames from sparse updates, playback commands
//! - state: replicated dictionary with update index, advisory locks, ghost reaping
//! - health: receive rates, round-trip time and optional reporting
//! - session: the per-connection façade tying it together

pub mod commands;
pub mod error;
pub mod frame;
pub mod health;
pub mod listeners;
pub mod merge_buffer;
pub mod runtime;
pub mod session;
pub mod state;
pub mod stream;
pub mod trajectory;

/// Tracing target used for lifecycle events emitted by this crate.
pub const LOG_TARGET: &str = "network_client";

pub use commands::{CommandClient, CommandError, PendingCommand};
pub use error::{SessionError, SessionResult};
pub use frame::{Frame, FrameAssembler, FrameChanges};
pub use health::ConnectionHealth;
pub use merge_buffer::MergeBuffer;
pub use runtime::{ClientNetworkRuntime, RuntimeError};
pub use session::{Session, SessionStatus, TickReport};
pub use state::{GhostReaper, SharedResource, SharedStateStore, StateEvent};
pub use stream::{ReceiverError, StreamReceiver};
pub use trajectory::{FrameChanged, TrajectoryError, TrajectorySession};
