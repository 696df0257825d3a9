//! Client for the local overlay-network control port.
//!
//! The control protocol is line-oriented: synchronous command replies
//! (`250 ...`, `5xx ...`) are interleaved on the same TCP stream with
//! asynchronous event lines (`650 ...`). The connection task demultiplexes
//! the two; commands are answered in order, events flow into a bounded
//! channel so a slow consumer can never stall the reader.

mod conn;
pub mod directory;
pub mod events;

pub use self::conn::{Auth, ControlConnection, ControlHandle, Reply};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control connection closed")]
    Closed,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("command failed with status {status}: {message}")]
    CommandFailed { status: u16, message: String },
    #[error("malformed control reply: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Opaque circuit handle assigned by the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitId(pub String);

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque stream handle assigned by the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
