//! Fehler- und Ergebnis-Typen für clientseitige Sitzungen.

use network_shared::transport::TransportError;
use thiserror::Error;

use crate::{runtime::RuntimeError, stream::ReceiverError, trajectory::TrajectoryError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already open")]
    AlreadyOpen,
    #[error("session is not open")]
    NotOpen,
    #[error("{stream} stream failed: {source}")]
    Receiver {
        stream: &'static str,
        #[source]
        source: ReceiverError,
    },
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type SessionResult<T> = Result<T, SessionError>;
