//! # Vigil Cluster
//!
//! Resilient audit-and-recovery core for a distributed pub/sub broker.
//!
//! When a broker node enqueues, requeues, touches, or acknowledges a
//! message, this crate shadows those events into a time-bucketed audit log
//! keyed by the originating host. If the originating host fails to
//! acknowledge messages before their audit deadline, one surviving node,
//! elected by cluster consensus, replays the unacknowledged messages back
//! into the broker, restoring at-least-once delivery across node loss.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Audit delegate, auditor, and recovery coordination
pub mod audit;

/// Cluster configuration
pub mod config;

/// Per-role single-winner elections
pub mod election;

/// Cluster error types and handling
pub mod error;

/// Membership, user events, and registration propagation
pub mod gossip;

/// Node assembly and lifecycle
pub mod node;

/// Thread-safe registration database
pub mod registry;

/// Per-host expiry wheel
pub mod wheel;

pub use crate::{
    audit::{AuditDelegate, AuditEnvelope, Auditor},
    config::{AuditConfig, Config, ConfigBuilder, ElectionConfig, GossipConfig, NodeConfig},
    election::ElectionService,
    error::{Error, Result},
    gossip::{GossipDelegate, GossipService, Member, MemberEvent, MemberTags},
    node::VigilNode,
    registry::{Producer, Registration, RegistrationDb},
    wheel::{Host, HostSet, RecoveryTrigger},
};
