//! Length-prefixed bincode framing for byte-stream transports.

pub mod codec;

pub use codec::{DEFAULT_MAX_MESSAGE_SIZE, read_message, write_message};
