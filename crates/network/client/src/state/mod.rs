//! Replizierter Schlüssel/Wert-Zustand mit beratenden Locks.
//!
//! [`SharedStateStore`] puffert lokale Schreibzugriffe bis zum nächsten Flush
//! und zeigt nur, was der Server zurückgespielt hat. [`GhostReaper`] räumt
//! Peers ab, deren Heartbeat ausbleibt; [`SharedResource`] bietet eine
//! typisierte, durch einen Lock geschützte Sicht auf einen Schlüssel.

pub mod lock;
pub mod reaper;
pub mod resource;
pub mod store;

use network_shared::Value;

pub use lock::{LockOutcome, LockTicket};
pub use reaper::GhostReaper;
pub use resource::{LockState, Pose, PoseCodec, ResourceEvent, SharedResource, ValueCodec};
pub use store::SharedStateStore;

/// Notification emitted by the store on the tick thread.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Updated { key: String, value: Value },
    Removed { key: String },
    LockGranted { key: String },
    LockRejected { key: String },
}

impl StateEvent {
    pub fn key(&self) -> &str {
        match self {
            StateEvent::Updated { key, .. }
            | StateEvent::Removed { key }
            | StateEvent::LockGranted { key }
            | StateEvent::LockRejected { key } => key,
        }
    }
}
