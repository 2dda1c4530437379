//! Error types for pipewatch.

use thiserror::Error;

/// Result type alias using pipewatch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pipewatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A send to a subscriber failed (closed connection, write error, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Transport failures are routine fan-out outcomes; everything else is an
    /// anomaly worth a louder log line.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
