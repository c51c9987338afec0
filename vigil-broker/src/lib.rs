//! # Vigil Broker
//!
//! The boundary contract with the message broker, plus an in-memory broker
//! implementation backing the audit pipeline and the test suites.
//!
//! The broker's own persistence, wire protocol, and client connection
//! handling are external concerns; this crate models only what the
//! audit/recovery core consumes: topics with channels, the publish
//! primitive, ID generation, and the message lifecycle hooks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;

pub use broker::{
    Broker, Channel, LifecycleEvent, MessageDelegate, Topic, TopicStats, EPHEMERAL_SUFFIX,
};
