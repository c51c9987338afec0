//! # Gossip Layer
//!
//! Cluster membership, tag-encoded peer metadata, and user-event
//! broadcast for topic/channel existence.
//!
//! Membership is heartbeat-based: every interval a node sends its member
//! list (with per-member last-heard timestamps and advertised tags) to
//! all known peers over UDP. Unknown members newer than the failure
//! timeout are merged as joins; members silent past the failure timeout
//! are dropped as failures. Join, failure, and user events are delivered
//! on an internal channel consumed by the node's event loop, which is the
//! only writer of the registration database.
//!
//! The same transport carries election and audit-replication packets for
//! the election service and the auditor.

use crate::{
    audit::AuditOp,
    config::Config,
    election::{ElectionMessage, ElectionService},
    error::{Error, Result},
};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc, sync::watch};
use tracing::{debug, error, info, warn};

/// Maximum UDP datagram we will encode or accept.
const MAX_PACKET_SIZE: usize = 65_536;

/// Tag-encoded peer metadata advertised by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTags {
    /// Node role, always `"broker"` for vigil nodes
    pub role: String,
    /// Advertised TCP port
    pub tcp_port: u16,
    /// Advertised HTTP port
    pub http_port: u16,
    /// Optional advertised HTTPS port
    pub https_port: Option<u16>,
    /// Address advertised to clients
    pub broadcast_address: String,
    /// Peer hostname
    pub hostname: String,
    /// Peer version string
    pub version: String,
}

/// A cluster member: name, gossip address, tags, and freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Node name: `broadcast-addr:tcp-port`
    pub name: String,
    /// Address the member's gossip socket is reachable at
    pub gossip_addr: SocketAddr,
    /// Advertised metadata
    pub tags: MemberTags,
    /// Unix-millisecond instant the member was last heard from
    pub last_heard_ms: i64,
}

/// Membership transitions and user events, delivered to the node's event
/// loop.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    /// A member joined or was discovered
    Join(Member),
    /// A member went silent past the failure timeout
    Failed(Member),
    /// A broadcast user event
    User {
        /// Event name (`topic+`, `channel-`, ...)
        name: String,
        /// JSON payload
        payload: Vec<u8>,
    },
}

/// Optional hook notified after each processed gossip event.
///
/// Used by tests to detect convergence without polling.
pub trait GossipDelegate: Send + Sync {
    /// An event was fully processed by the node's event loop.
    fn notify(&self);
}

/// User-event payload: `{"n":name,"t":topic,"c":channel,"r":nonce}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEventPayload {
    /// Originating node name
    #[serde(rename = "n")]
    pub name: String,
    /// Topic name
    #[serde(rename = "t")]
    pub topic: String,
    /// Channel name, or empty
    #[serde(rename = "c")]
    pub channel: String,
    /// Random nonce to defeat duplicate-event suppression
    #[serde(rename = "r")]
    pub rnd: i64,
}

/// Wire packets exchanged between gossip sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Packet {
    /// Join request sent to a seed
    Join {
        /// The joining member
        from: Member,
    },
    /// Membership snapshot, sent in response to a join
    Members {
        /// Known members including the sender
        members: Vec<Member>,
    },
    /// Periodic liveness beacon with piggybacked membership
    Heartbeat {
        /// The beaconing member
        from: Member,
        /// The sender's member list
        members: Vec<Member>,
    },
    /// Broadcast user event
    UserEvent {
        /// Event name (`topic+`, `channel-`, ...)
        name: String,
        /// JSON payload
        payload: Vec<u8>,
    },
    /// Election traffic
    Election(ElectionMessage),
    /// Audit wheel replication
    Audit(AuditOp),
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Shared membership view: the local member plus everything heard of.
pub(crate) struct Membership {
    local: Member,
    failure_timeout: Duration,
    members: Mutex<HashMap<String, Member>>,
}

impl Membership {
    fn new(local: Member, failure_timeout: Duration) -> Self {
        let mut members = HashMap::new();
        members.insert(local.name.clone(), local.clone());
        Self { local, failure_timeout, members: Mutex::new(members) }
    }

    pub(crate) fn local(&self) -> &Member {
        &self.local
    }

    /// All known members, the local node included.
    pub(crate) fn members(&self) -> Vec<Member> {
        self.members.lock().values().cloned().collect()
    }

    pub(crate) fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub(crate) fn get(&self, name: &str) -> Option<Member> {
        self.members.lock().get(name).cloned()
    }

    /// Addresses of every member except the local node.
    fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.members
            .lock()
            .values()
            .filter(|m| m.name != self.local.name)
            .map(|m| m.gossip_addr)
            .collect()
    }

    /// Record a member heard from directly; returns the member if it was
    /// previously unknown.
    pub(crate) fn observe_direct(&self, mut member: Member) -> Option<Member> {
        if member.name == self.local.name {
            return None;
        }
        member.last_heard_ms = now_millis();
        let mut members = self.members.lock();
        let fresh = members.insert(member.name.clone(), member.clone()).is_none();
        fresh.then_some(member)
    }

    /// Merge a piggybacked member entry; returns the member if it was
    /// previously unknown and fresh enough to admit.
    fn observe_indirect(&self, member: Member) -> Option<Member> {
        if member.name == self.local.name {
            return None;
        }
        let mut members = self.members.lock();
        match members.get_mut(&member.name) {
            Some(existing) => {
                if member.last_heard_ms > existing.last_heard_ms {
                    existing.last_heard_ms = member.last_heard_ms;
                }
                None
            },
            None => {
                let age = now_millis().saturating_sub(member.last_heard_ms);
                if age >= self.failure_timeout.as_millis() as i64 {
                    return None;
                }
                members.insert(member.name.clone(), member.clone());
                Some(member)
            },
        }
    }

    /// List with the local entry stamped fresh, for piggybacking.
    fn list_for_send(&self) -> Vec<Member> {
        let now = now_millis();
        self.members
            .lock()
            .values()
            .map(|m| {
                let mut m = m.clone();
                if m.name == self.local.name {
                    m.last_heard_ms = now;
                }
                m
            })
            .collect()
    }

    /// Drop members silent past the failure timeout; returns the removals.
    fn sweep(&self) -> Vec<Member> {
        let now = now_millis();
        let timeout = self.failure_timeout.as_millis() as i64;
        let mut members = self.members.lock();
        let failed: Vec<Member> = members
            .values()
            .filter(|m| m.name != self.local.name && now - m.last_heard_ms > timeout)
            .cloned()
            .collect();
        for member in &failed {
            members.remove(&member.name);
        }
        failed
    }
}

/// Outbound side of the gossip socket, shared with the election service
/// and the auditor.
///
/// UDP sends use the non-blocking path; a send that would block is
/// dropped and logged, which the protocol tolerates (re-gossip and
/// heartbeats repair lost state).
pub(crate) struct Transport {
    socket: Arc<UdpSocket>,
    membership: Arc<Membership>,
}

impl Transport {
    pub(crate) fn send_to_addr(&self, addr: SocketAddr, packet: &Packet) {
        let encoded = match bincode::serialize(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode gossip packet");
                return;
            },
        };
        if encoded.len() > MAX_PACKET_SIZE {
            error!(len = encoded.len(), "gossip packet exceeds maximum datagram size");
            return;
        }
        if let Err(e) = self.socket.try_send_to(&encoded, addr) {
            debug!(peer = %addr, error = %e, "failed to send gossip packet");
        }
    }

    /// Send to every member except the local node.
    pub(crate) fn broadcast(&self, packet: &Packet) {
        for addr in self.membership.peer_addrs() {
            self.send_to_addr(addr, packet);
        }
    }

    /// Send to a member by name. Returns whether the member was known.
    pub(crate) fn send_to_member(&self, name: &str, packet: &Packet) -> bool {
        match self.membership.get(name) {
            Some(member) => {
                self.send_to_addr(member.gossip_addr, packet);
                true
            },
            None => false,
        }
    }

    pub(crate) fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }
}

/// The gossip service: socket, membership, and the protocol loops.
pub struct GossipService {
    config: Config,
    socket: Arc<UdpSocket>,
    membership: Arc<Membership>,
    transport: Arc<Transport>,
    event_tx: mpsc::UnboundedSender<MemberEvent>,
}

impl GossipService {
    /// Bind the gossip socket and assemble the local member from the
    /// configuration's advertised tags.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        config: Config,
        event_tx: mpsc::UnboundedSender<MemberEvent>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(&config.gossip.address)
            .await
            .map_err(|e| Error::gossip_transport(format!("bind {}: {e}", config.gossip.address)))?;
        let local_addr = socket.local_addr()?;

        let local = Member {
            name: config.node_name(),
            gossip_addr: local_addr,
            tags: MemberTags {
                role: "broker".to_string(),
                tcp_port: config.node.tcp_port,
                http_port: config.node.http_port,
                https_port: config.node.https_port,
                broadcast_address: config.gossip.broadcast_address.clone(),
                hostname: config.node.hostname.clone(),
                version: config.node.version.clone(),
            },
            last_heard_ms: now_millis(),
        };

        info!(name = %local.name, addr = %local_addr, "gossip socket bound");

        let socket = Arc::new(socket);
        let membership = Arc::new(Membership::new(local, config.gossip.failure_timeout()));
        let transport =
            Arc::new(Transport { socket: socket.clone(), membership: membership.clone() });

        Ok(Self { config, socket, membership, transport, event_tx })
    }

    /// The local member record.
    pub fn local_member(&self) -> Member {
        self.membership.local().clone()
    }

    /// All known members, the local node included.
    pub fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    /// Number of known members.
    pub fn member_count(&self) -> usize {
        self.membership.member_count()
    }

    pub(crate) fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    /// Broadcast a user event and deliver it locally.
    ///
    /// The event name encodes the operation in its trailing character
    /// (`topic+`, `topic-`, `topic=`, `channel+`, `channel-`,
    /// `channel=`).
    pub fn send_user_event(&self, event_name: &str, topic: &str, channel: &str) -> Result<()> {
        let payload = GossipEventPayload {
            name: self.membership.local().name.clone(),
            topic: topic.to_string(),
            channel: channel.to_string(),
            rnd: rand::thread_rng().gen(),
        };
        let payload = serde_json::to_vec(&payload)?;

        self.transport.broadcast(&Packet::UserEvent {
            name: event_name.to_string(),
            payload: payload.clone(),
        });

        // user events are delivered to the emitting node as well
        self.event_tx
            .send(MemberEvent::User { name: event_name.to_string(), payload })
            .map_err(|_| Error::GossipEvent("event loop has shut down".to_string()))?;
        Ok(())
    }

    /// Receive loop: decodes packets and routes them to membership, the
    /// event channel, the election service, or the audit channel.
    pub(crate) async fn run_receiver(
        self: Arc<Self>,
        election: Arc<ElectionService>,
        audit_tx: mpsc::UnboundedSender<AuditOp>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "gossip receive failed");
                            continue;
                        },
                    };
                    let packet: Packet = match bincode::deserialize(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            error!(peer = %src, error = %e, "failed to decode gossip packet");
                            continue;
                        },
                    };
                    self.handle_packet(packet, src, &election, &audit_tx);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("gossip receiver exiting");
                        return;
                    }
                }
            }
        }
    }

    fn handle_packet(
        &self,
        packet: Packet,
        src: SocketAddr,
        election: &Arc<ElectionService>,
        audit_tx: &mpsc::UnboundedSender<AuditOp>,
    ) {
        match packet {
            Packet::Join { from } => {
                debug!(member = %from.name, peer = %src, "join request");
                if let Some(joined) = self.membership.observe_direct(from) {
                    self.emit(MemberEvent::Join(joined));
                }
                // answer with our full view so the joiner converges fast
                self.transport
                    .send_to_addr(src, &Packet::Members { members: self.membership.list_for_send() });
            },
            Packet::Members { members } => {
                for member in members {
                    if let Some(joined) = self.membership.observe_indirect(member) {
                        self.emit(MemberEvent::Join(joined));
                    }
                }
            },
            Packet::Heartbeat { from, members } => {
                if let Some(joined) = self.membership.observe_direct(from) {
                    self.emit(MemberEvent::Join(joined));
                }
                for member in members {
                    if let Some(joined) = self.membership.observe_indirect(member) {
                        self.emit(MemberEvent::Join(joined));
                    }
                }
            },
            Packet::UserEvent { name, payload } => {
                self.emit(MemberEvent::User { name, payload });
            },
            Packet::Election(message) => {
                election.handle_message(message);
            },
            Packet::Audit(op) => {
                if audit_tx.send(op).is_err() {
                    warn!("audit channel closed, dropping replication packet");
                }
            },
        }
    }

    fn emit(&self, event: MemberEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("event loop has shut down, dropping gossip event");
        }
    }

    /// Heartbeat loop: beacons membership to all peers and sweeps
    /// silent members as failures.
    pub(crate) async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gossip.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut local = self.membership.local().clone();
                    local.last_heard_ms = now_millis();
                    let packet = Packet::Heartbeat {
                        from: local,
                        members: self.membership.list_for_send(),
                    };
                    self.transport.broadcast(&packet);

                    for failed in self.membership.sweep() {
                        warn!(member = %failed.name, "member failed");
                        self.emit(MemberEvent::Failed(failed));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("heartbeat loop exiting");
                        return;
                    }
                }
            }
        }
    }

    /// Seed join loop: contact the configured seeds with back-off until
    /// at least one other node is known or shutdown is requested.
    pub(crate) async fn run_join_seeds(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.gossip.seed_addresses.is_empty() {
            return;
        }

        let retry = self.config.gossip.join_retry_interval();
        loop {
            for seed in &self.config.gossip.seed_addresses {
                match seed.parse::<SocketAddr>() {
                    Ok(addr) => {
                        self.transport
                            .send_to_addr(addr, &Packet::Join { from: self.local_member() });
                    },
                    Err(e) => error!(seed = %seed, error = %e, "invalid seed address"),
                }
            }

            // give the responses a moment to arrive
            tokio::time::sleep(Duration::from_millis(250)).await;
            let contacted = self.member_count().saturating_sub(1);
            if contacted > 0 {
                info!(nodes = contacted, "joined gossip cluster");
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
