//! # Cluster Error Handling
//!
//! Error types for the audit/recovery cluster core.

use thiserror::Error;

/// Cluster-specific error types for the vigil system
#[derive(Error, Debug)]
pub enum Error {
    /// Cluster membership errors
    #[error("Membership error: {0}")]
    Membership(String),

    /// Gossip transport errors
    #[error("Gossip transport error: {0}")]
    GossipTransport(String),

    /// Gossip event dissemination failures
    #[error("Gossip event error: {0}")]
    GossipEvent(String),

    /// Leader election failures
    #[error("Election failed: {0}")]
    Election(String),

    /// Election lost to another candidate
    #[error("Election lost for role {role}")]
    ElectionLost {
        /// Role that was contested
        role: String,
    },

    /// Timeout waiting for an election to complete
    #[error("Election timeout for role {role} after {timeout_ms}ms")]
    ElectionTimeout {
        /// Role that was contested
        role: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Audit pipeline errors
    #[error("Audit error: {0}")]
    Audit(String),

    /// Recovery replay errors
    #[error("Recovery failed: {0}")]
    Recovery(String),

    /// Cluster configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Core message errors
    #[error("Core error: {0}")]
    Core(#[from] vigil_core::Error),

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding errors
    #[error("Binary encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl Error {
    /// Create a new membership error
    pub fn membership<T: std::fmt::Display>(message: T) -> Self {
        Self::Membership(message.to_string())
    }

    /// Create a new gossip transport error
    pub fn gossip_transport<T: std::fmt::Display>(message: T) -> Self {
        Self::GossipTransport(message.to_string())
    }

    /// Create a new election error
    pub fn election<T: std::fmt::Display>(message: T) -> Self {
        Self::Election(message.to_string())
    }

    /// Create a new audit error
    pub fn audit<T: std::fmt::Display>(message: T) -> Self {
        Self::Audit(message.to_string())
    }

    /// Create a new configuration error
    pub fn configuration<T: std::fmt::Display>(message: T) -> Self {
        Self::Configuration(message.to_string())
    }

    /// Check if this error indicates a temporary condition that may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GossipTransport(_)
                | Self::GossipEvent(_)
                | Self::ElectionLost { .. }
                | Self::ElectionTimeout { .. }
                | Self::Io(_)
        )
    }
}

/// A specialized `Result` type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
