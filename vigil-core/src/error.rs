//! Error types for the vigil core library.

use thiserror::Error;

/// Main error type for vigil core operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid message format or content
    #[error("Invalid message: {message}")]
    InvalidMessage {
        /// Description of what made the message invalid
        message: String,
    },

    /// Invalid topic name
    #[error("Invalid topic: {message}")]
    InvalidTopic {
        /// Description of what made the topic invalid
        message: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Underlying serialization failure
        message: String,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal failure
        message: String,
    },
}

/// Result type alias for vigil core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}
