//! # Audit Pipeline
//!
//! Intercepts broker message lifecycle events, tags each message with its
//! originating host, and maintains the per-host expiry wheels that drive
//! recovery.
//!
//! The [`AuditDelegate`] shadows every enqueue into the `audit.send`
//! topic and every acknowledgement into `audit.finish`. Internal
//! consumers of those topics feed the [`Auditor`], which schedules and
//! cancels entries on the per-host wheels and replicates each mutation to
//! every peer so the audit log survives the loss of the originating node.
//! When a wheel bucket expires non-empty, the auditor runs the per-host
//! recovery election and, if it wins, replays the outstanding messages
//! into their origin topics.

use crate::{
    election::ElectionService,
    gossip::{Packet, Transport},
    wheel::{Host, HostSet, RecoveryTrigger},
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, info};
use vigil_broker::{Broker, MessageDelegate};
use vigil_core::{Message, MessageId, Topic};

/// Topic receiving an audit envelope for every enqueued message.
pub const AUDIT_SEND_TOPIC: &str = "audit.send";

/// Topic receiving the bare message ID for every acknowledged message.
pub const AUDIT_FINISH_TOPIC: &str = "audit.finish";

/// Prefix reserving the internal audit topics. Messages entering these
/// topics are never themselves audited, and their existence is never
/// gossiped.
pub const AUDIT_TOPIC_PREFIX: &str = "audit.";

/// The audit record: enough information to republish a message later if
/// its origin node fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEnvelope {
    /// Hostname of the originating node
    pub hostname: String,
    /// Topic the message was originally published to (serialized as its
    /// bare name)
    pub topic: Topic,
    /// The original message
    pub message: Message,
}

impl AuditEnvelope {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> serde_json::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from the JSON wire form. Returns `None` for anything that
    /// does not parse as a complete envelope.
    pub fn decode(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}

/// Pull the originating hostname out of an audit body.
///
/// Returns `None` when the body is not JSON, the field is missing, or it
/// is not a string; callers treat that as a silent no-op.
pub fn extract_hostname(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("hostname")?.as_str().map(str::to_string)
}

/// Audit wheel mutations replicated to every peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditOp {
    /// Schedule (or reschedule) an audit entry; `body` is the envelope
    Entry {
        /// JSON audit envelope bytes
        body: Vec<u8>,
    },
    /// Remove an acknowledged entry
    Finish {
        /// Original message ID
        id: MessageId,
    },
    /// Push an entry's deadline out by one expiration interval
    Touch {
        /// Original message ID
        id: MessageId,
    },
}

/// Broker lifecycle hook implementation feeding the audit topics.
pub struct AuditDelegate {
    hostname: String,
    broker: Arc<Broker>,
    auditor: Arc<Auditor>,
}

impl AuditDelegate {
    /// Create a delegate tagging messages with `hostname`.
    pub fn new(hostname: impl Into<String>, broker: Arc<Broker>, auditor: Arc<Auditor>) -> Self {
        Self { hostname: hostname.into(), broker, auditor }
    }
}

impl MessageDelegate for AuditDelegate {
    fn on_queue(&self, message: &Message, topic: &str) {
        // never audit the audit topics themselves
        if topic.starts_with(AUDIT_TOPIC_PREFIX) {
            return;
        }

        let topic = match Topic::new(topic) {
            Ok(topic) => topic,
            Err(e) => {
                error!(id = %message.id, error = %e, "unauditable topic name");
                return;
            },
        };
        let envelope = AuditEnvelope {
            hostname: self.hostname.clone(),
            topic,
            message: message.clone(),
        };
        match envelope.encode() {
            Ok(body) => {
                let audit = Message::with_id(self.broker.new_id(), body);
                self.broker.get_topic(AUDIT_SEND_TOPIC).put_message(audit);
                debug!(id = %message.id, topic = %envelope.topic, "audit: queue");
            },
            Err(e) => error!(id = %message.id, error = %e, "failed to encode audit envelope"),
        }
    }

    fn on_finish(&self, message: &Message) {
        let fin = Message::with_id(
            self.broker.new_id(),
            Bytes::copy_from_slice(&message.id.to_bytes()),
        );
        self.broker.get_topic(AUDIT_FINISH_TOPIC).put_message(fin);
        debug!(id = %message.id, "audit: finish");
    }

    fn on_requeue(&self, message: &Message, _delay: Duration) {
        self.auditor.req(message);
    }

    fn on_touch(&self, message: &Message) {
        self.auditor.touch(message);
    }
}

// Recalls the election role and clears the recovery latch on every exit
// path of a recovery attempt.
struct RecallGuard {
    election: Arc<ElectionService>,
    host: Arc<Host>,
    role: String,
}

impl Drop for RecallGuard {
    fn drop(&mut self) {
        self.election.run_recall_election(&self.role);
        self.host.set_recovery(false);
    }
}

/// Owns the per-host wheels and drives the expiry → election → replay
/// pipeline.
pub struct Auditor {
    me: Weak<Auditor>,
    broker: Arc<Broker>,
    election: Arc<ElectionService>,
    hosts: HostSet,
    // original message ID -> hostname currently auditing it
    index: DashMap<MessageId, String>,
    expiration: Duration,
    transport: OnceLock<Arc<Transport>>,
    shutdown: watch::Receiver<bool>,
}

impl Auditor {
    /// Create an auditor. Host expiry loops are spawned lazily as hosts
    /// appear, so this must be called within a tokio runtime.
    pub fn new(
        broker: Arc<Broker>,
        election: Arc<ElectionService>,
        expiration: Duration,
        wheel_quantum: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            broker,
            election,
            hosts: HostSet::new(wheel_quantum),
            index: DashMap::new(),
            expiration,
            transport: OnceLock::new(),
            shutdown,
        })
    }

    /// Wire the gossip transport used to replicate wheel mutations.
    pub(crate) fn set_transport(&self, transport: Arc<Transport>) {
        let _ = self.transport.set(transport);
    }

    /// Schedule an audit entry from a consumed `audit.send` message and
    /// replicate it to all peers.
    pub fn audit(&self, message: &Message) {
        self.apply_entry(&message.body);
        self.replicate(AuditOp::Entry { body: message.body.to_vec() });
    }

    /// Remove an entry from a consumed `audit.finish` message (body is
    /// the bare original message ID) and replicate the removal.
    pub fn fin(&self, message: &Message) {
        let Some(id) = MessageId::from_slice(&message.body) else {
            return;
        };
        self.apply_finish(id);
        self.replicate(AuditOp::Finish { id });
    }

    /// Reschedule a requeued message's audit deadline.
    pub fn req(&self, message: &Message) {
        self.apply_touch(message.id);
        self.replicate(AuditOp::Touch { id: message.id });
    }

    /// Reschedule a touched message's audit deadline.
    pub fn touch(&self, message: &Message) {
        self.apply_touch(message.id);
        self.replicate(AuditOp::Touch { id: message.id });
    }

    /// Apply a replicated wheel mutation from a peer.
    pub fn apply_op(&self, op: AuditOp) {
        match op {
            AuditOp::Entry { body } => self.apply_entry(&body),
            AuditOp::Finish { id } => self.apply_finish(id),
            AuditOp::Touch { id } => self.apply_touch(id),
        }
    }

    /// Outstanding audit entries for a host, if it is tracked.
    pub fn outstanding(&self, hostname: &str) -> usize {
        self.hosts.get(hostname).map_or(0, |h| h.message_count())
    }

    // The envelope's hostname keys the wheel; a malformed body or a
    // missing/non-string hostname means there is nothing to audit
    // against, so the operation silently drops the record.
    fn apply_entry(&self, body: &[u8]) {
        let Some(hostname) = extract_hostname(body) else {
            return;
        };
        let Some(envelope) = AuditEnvelope::decode(body) else {
            return;
        };
        let original_id = envelope.message.id;

        // an entry re-audited by another host (a replay winner) migrates:
        // drop the placement under the previous hostname everywhere
        if let Some(previous) = self.index.insert(original_id, hostname.clone()) {
            if previous != hostname {
                if let Some(old_host) = self.hosts.get(&previous) {
                    old_host.remove_message(&original_id);
                }
            }
        }

        let host = self.get_host(&hostname);
        let deadline_ms = Utc::now().timestamp_millis() + self.expiration.as_millis() as i64;
        host.add_message(Message::with_id(original_id, Bytes::copy_from_slice(body)), deadline_ms);
    }

    fn apply_finish(&self, id: MessageId) {
        let Some((_, hostname)) = self.index.remove(&id) else {
            return;
        };
        if let Some(host) = self.hosts.get(&hostname) {
            host.remove_message(&id);
        }
    }

    fn apply_touch(&self, id: MessageId) {
        let Some(hostname) = self.index.get(&id).map(|entry| entry.value().clone()) else {
            return;
        };
        let Some(host) = self.hosts.get(&hostname) else {
            return;
        };
        let Some(bucket) = host.get_messages().get(&id).cloned() else {
            return;
        };
        let Some(stored) = bucket.get_message(&id) else {
            return;
        };
        let deadline_ms = Utc::now().timestamp_millis() + self.expiration.as_millis() as i64;
        host.add_message(stored, deadline_ms);
    }

    fn get_host(&self, hostname: &str) -> Arc<Host> {
        let (host, created) = self.hosts.get_or_create(hostname);
        if created {
            if let Some(auditor) = self.me.upgrade() {
                debug!(host = hostname, "starting expiry loop");
                tokio::spawn(host.clone().run(auditor, self.shutdown.clone()));
            }
        }
        host
    }

    fn replicate(&self, op: AuditOp) {
        if let Some(transport) = self.transport.get() {
            transport.broadcast(&Packet::Audit(op));
        }
    }

    // The expiry → election → replay pipeline for one host. The recall
    // guard releases the role and the recovery latch on every exit path.
    async fn recover(self: Arc<Self>, host: Arc<Host>) {
        if !host.set_recovery(true) {
            return;
        }

        let role = host.recovery_topic();
        let _guard = RecallGuard {
            election: self.election.clone(),
            host: host.clone(),
            role: role.clone(),
        };

        // expired buckets are detached from the chain, so the outstanding
        // entries are pushed one expiration out; a failed election is then
        // retried on a later bucket expiry instead of orphaning them
        let deadline_ms = Utc::now().timestamp_millis() + self.expiration.as_millis() as i64;
        for (id, bucket) in host.get_messages() {
            if let Some(stored) = bucket.get_message(&id) {
                host.add_message(stored, deadline_ms);
            }
        }

        info!(host = %host.hostname(), "audit deadline passed, running recovery election");
        match self.election.run_election(&role).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                debug!(host = %host.hostname(), error = %e, "recovery election not won");
                return;
            },
            Err(_) => {
                debug!(host = %host.hostname(), "recovery election channel dropped");
                return;
            },
        }

        let snapshot = host.get_messages();
        info!(host = %host.hostname(), outstanding = snapshot.len(), "won recovery election, replaying");

        let mut replayed = 0usize;
        for (id, bucket) in snapshot {
            let Some(stored) = bucket.get_message(&id) else {
                continue;
            };
            let Some(envelope) = AuditEnvelope::decode(&stored.body) else {
                continue;
            };
            // republishing runs through our own delegate, re-auditing the
            // message under this host and migrating the entry cluster-wide
            self.broker.get_topic(envelope.topic.as_str()).put_message(envelope.message);
            replayed += 1;
        }

        info!(host = %host.hostname(), replayed, "recovery replay complete");
    }
}

impl RecoveryTrigger for Auditor {
    fn initiate_recovery(&self, host: &Arc<Host>) {
        let Some(auditor) = self.me.upgrade() else {
            return;
        };
        let host = host.clone();
        tokio::spawn(auditor.recover(host));
    }
}
