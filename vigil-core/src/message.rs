//! Message types and utilities shared across the vigil system.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a message.
///
/// A fixed-width opaque identifier; the broker guarantees cluster-wide
/// uniqueness. The cluster core treats it as bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new unique message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a message ID from a UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Get the raw 16-byte representation.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Rebuild a message ID from its raw 16-byte representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Try to rebuild a message ID from a byte slice.
    ///
    /// Returns `None` unless the slice is exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 16] = bytes.try_into().ok()?;
        Some(Self::from_bytes(raw))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Topic name for message routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Create a new topic.
    ///
    /// # Errors
    /// Returns an error if the topic name is empty, too long, or contains
    /// invalid characters.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidTopic {
                message: "Topic name cannot be empty".to_string(),
            });
        }

        if name.len() > 255 {
            return Err(crate::Error::InvalidTopic {
                message: "Topic name cannot exceed 255 characters".to_string(),
            });
        }

        if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
            return Err(crate::Error::InvalidTopic {
                message: "Topic name contains invalid characters".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get the topic name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A message: an opaque payload plus its identifier.
///
/// The cluster core never inspects the payload except when decoding an
/// audit envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Opaque message payload
    pub body: Bytes,

    /// Enqueue timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a freshly generated ID.
    pub fn new(body: Bytes) -> Self {
        Self { id: MessageId::new(), body, timestamp: Utc::now() }
    }

    /// Create a message with an explicit ID.
    pub fn with_id(id: MessageId, body: Bytes) -> Self {
        Self { id, body, timestamp: Utc::now() }
    }

    /// Get the payload size in bytes.
    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}
