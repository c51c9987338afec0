//! # Vigil Core
//!
//! Core message model for the vigil audit/recovery system.
//!
//! This crate provides the fundamental building blocks shared by the broker
//! boundary and the cluster core:
//! - Message identifiers and message definitions
//! - Topic name validation
//! - Core error types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;

pub use error::{Error, Result};
pub use message::{Message, MessageId, Topic};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::{Error, Message, MessageId, Result, Topic};
    pub use bytes::Bytes;
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
