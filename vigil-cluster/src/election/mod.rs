//! # Election Service
//!
//! Per-role cluster-wide elections returning a single winner to the local
//! caller.
//!
//! A candidate broadcasts a campaign for a named role. Every node grants
//! at most one candidate per role and keeps that grant until the holder
//! recalls the role, so two candidates can never both assemble a majority
//! of the currently-active members. The caller receives the outcome on a
//! one-shot channel: `Ok(())` for the single winner, an error for
//! everyone else (lost, timed out, or partitioned).

use crate::{
    error::{Error, Result},
    gossip::{Packet, Transport},
};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Election wire messages, carried inside gossip packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ElectionMessage {
    /// A candidate requests the role
    Campaign {
        /// Contested role name
        role: String,
        /// Candidate node name
        candidate: String,
        /// Random nonce
        rnd: i64,
    },
    /// A voter's response to a campaign
    Vote {
        /// Contested role name
        role: String,
        /// Candidate the vote is addressed to
        candidate: String,
        /// Voting node name
        voter: String,
        /// Whether the vote was granted
        granted: bool,
    },
    /// The holder releases the role
    Recall {
        /// Released role name
        role: String,
        /// The recalling (holding) node name
        candidate: String,
    },
}

struct Pending {
    total: usize,
    needed: usize,
    granted: usize,
    denied: usize,
    tx: Option<oneshot::Sender<Result<()>>>,
}

/// Cluster-wide single-winner elections with recall.
pub struct ElectionService {
    me: Weak<ElectionService>,
    node_name: String,
    timeout: Duration,
    transport: Arc<Transport>,
    // role -> candidate currently granted the role by this node
    grants: Mutex<HashMap<String, String>>,
    // role -> election this node is currently running
    pending: Mutex<HashMap<String, Pending>>,
}

impl ElectionService {
    /// Create an election service speaking over `transport`.
    pub(crate) fn new(node_name: String, timeout: Duration, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node_name,
            timeout,
            transport,
            grants: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Begin a cluster-wide election for `role`.
    ///
    /// Exactly one node in the reachable cluster receives `Ok(())` on the
    /// returned channel; all others receive an error. The winner holds
    /// the role until it calls [`run_recall_election`].
    ///
    /// [`run_recall_election`]: ElectionService::run_recall_election
    pub fn run_election(&self, role: &str) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();

        let total = self.transport.membership().member_count();
        let needed = total / 2 + 1;

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(role) {
                let _ = tx.send(Err(Error::election(format!(
                    "election for role {role} already in flight"
                ))));
                return rx;
            }
            pending.insert(
                role.to_string(),
                Pending { total, needed, granted: 0, denied: 0, tx: Some(tx) },
            );
        }

        debug!(role, total, needed, "starting election");

        // our own ballot goes through the same path as everyone else's
        let campaign = ElectionMessage::Campaign {
            role: role.to_string(),
            candidate: self.node_name.clone(),
            rnd: rand::thread_rng().gen(),
        };
        self.handle_message(campaign.clone());
        self.transport.broadcast(&Packet::Election(campaign));

        // elections that cannot assemble a majority resolve by timeout;
        // the jitter desynchronizes repeated symmetric contests
        if let Some(service) = self.me.upgrade() {
            let role = role.to_string();
            let timeout_ms = self.timeout.as_millis() as u64;
            let jitter = rand::thread_rng().gen_range(0..=timeout_ms / 2);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms + jitter)).await;
                if let Some(mut p) = service.pending.lock().remove(&role) {
                    debug!(role = %role, "election timed out");
                    if let Some(tx) = p.tx.take() {
                        let _ = tx.send(Err(Error::ElectionTimeout { role, timeout_ms }));
                    }
                }
            });
        }

        rx
    }

    /// Release `role` so another election for it may succeed.
    ///
    /// Only a grant held by this node is cleared on peers; a loser's
    /// recall cannot release the actual winner's role.
    pub fn run_recall_election(&self, role: &str) {
        debug!(role, "recalling election role");

        {
            let mut grants = self.grants.lock();
            if grants.get(role).is_some_and(|holder| holder == &self.node_name) {
                grants.remove(role);
            }
        }
        if let Some(mut p) = self.pending.lock().remove(role) {
            if let Some(tx) = p.tx.take() {
                let _ = tx.send(Err(Error::election(format!("role {role} recalled"))));
            }
        }

        self.transport.broadcast(&Packet::Election(ElectionMessage::Recall {
            role: role.to_string(),
            candidate: self.node_name.clone(),
        }));
    }

    /// Handle an election message (local or from the wire).
    pub(crate) fn handle_message(&self, message: ElectionMessage) {
        match message {
            ElectionMessage::Campaign { role, candidate, .. } => {
                self.handle_campaign(&role, &candidate);
            },
            ElectionMessage::Vote { role, candidate, voter, granted } => {
                if candidate != self.node_name {
                    return;
                }
                debug!(role = %role, voter = %voter, granted, "vote received");
                self.record_vote(&role, granted);
            },
            ElectionMessage::Recall { role, candidate } => {
                let mut grants = self.grants.lock();
                if grants.get(&role).is_some_and(|holder| holder == &candidate) {
                    debug!(role = %role, holder = %candidate, "grant recalled");
                    grants.remove(&role);
                }
            },
        }
    }

    fn handle_campaign(&self, role: &str, candidate: &str) {
        let granted = {
            let mut grants = self.grants.lock();
            match grants.get(role) {
                Some(holder) => holder == candidate,
                None => {
                    grants.insert(role.to_string(), candidate.to_string());
                    true
                },
            }
        };
        debug!(role, candidate, granted, "campaign processed");

        if candidate == self.node_name {
            self.record_vote(role, granted);
        } else {
            let vote = ElectionMessage::Vote {
                role: role.to_string(),
                candidate: candidate.to_string(),
                voter: self.node_name.clone(),
                granted,
            };
            if !self.transport.send_to_member(candidate, &Packet::Election(vote)) {
                debug!(role, candidate, "campaign from unknown member, vote dropped");
            }
        }
    }

    fn record_vote(&self, role: &str, granted: bool) {
        let mut pending = self.pending.lock();
        let Some(p) = pending.get_mut(role) else {
            return;
        };

        if granted {
            p.granted += 1;
        } else {
            p.denied += 1;
        }

        let result = if p.granted >= p.needed {
            info!(role, granted = p.granted, needed = p.needed, "election won");
            Some(Ok(()))
        } else if p.denied > p.total - p.needed {
            debug!(role, denied = p.denied, "election lost");
            Some(Err(Error::ElectionLost { role: role.to_string() }))
        } else {
            None
        };

        let Some(result) = result else { return };
        let tx = p.tx.take();
        pending.remove(role);
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    /// The candidate this node has currently granted `role` to, if any.
    pub fn current_holder(&self, role: &str) -> Option<String> {
        self.grants.lock().get(role).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gossip::GossipService;
    use tokio::sync::mpsc;

    async fn service() -> Arc<ElectionService> {
        let config = Config::builder()
            .gossip_address("127.0.0.1:0")
            .broadcast_address("127.0.0.1")
            .tcp_port(9000)
            .build()
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let gossip = GossipService::bind(config, tx).await.unwrap();
        ElectionService::new(
            gossip.local_member().name,
            Duration::from_millis(200),
            gossip.transport(),
        )
    }

    #[tokio::test]
    async fn test_single_node_wins_immediately() {
        let election = service().await;
        let result = election.run_election("recover:origin").await.unwrap();
        assert!(result.is_ok());
        assert_eq!(
            election.current_holder("recover:origin"),
            Some("127.0.0.1:9000".to_string())
        );
    }

    #[tokio::test]
    async fn test_role_held_until_recall() {
        let election = service().await;
        election.run_election("recover:origin").await.unwrap().unwrap();

        // a foreign campaign is denied while the role is held
        election.handle_message(ElectionMessage::Campaign {
            role: "recover:origin".to_string(),
            candidate: "10.0.0.9:4150".to_string(),
            rnd: 1,
        });
        assert_eq!(
            election.current_holder("recover:origin"),
            Some("127.0.0.1:9000".to_string())
        );

        election.run_recall_election("recover:origin");
        assert_eq!(election.current_holder("recover:origin"), None);

        // after the recall the role can be won again
        let result = election.run_election("recover:origin").await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_recall_does_not_release_holder() {
        let election = service().await;
        election.run_election("recover:origin").await.unwrap().unwrap();

        election.handle_message(ElectionMessage::Recall {
            role: "recover:origin".to_string(),
            candidate: "10.0.0.9:4150".to_string(),
        });
        assert_eq!(
            election.current_holder("recover:origin"),
            Some("127.0.0.1:9000".to_string())
        );
    }

    #[tokio::test]
    async fn test_concurrent_election_for_same_role_errors() {
        let election = service().await;

        // a second (unreachable) member keeps the first election pending:
        // our own grant alone is short of the majority of two
        election.transport.membership().observe_direct(crate::gossip::Member {
            name: "10.0.0.9:4150".to_string(),
            gossip_addr: "10.0.0.9:4160".parse().unwrap(),
            tags: crate::gossip::MemberTags {
                role: "broker".to_string(),
                tcp_port: 4150,
                http_port: 4151,
                https_port: None,
                broadcast_address: "10.0.0.9".to_string(),
                hostname: "other".to_string(),
                version: "0.1.0".to_string(),
            },
            last_heard_ms: 0,
        });

        let first = election.run_election("recover:origin");
        let second = election.run_election("recover:origin");
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Election(_)));

        // the first election resolves by timeout without a second vote
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ElectionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_lost_election_reports_promptly() {
        let election = service().await;

        // single voter, role already granted elsewhere: the only ballot
        // is a denial, so the loss resolves without waiting for timeout
        election.handle_message(ElectionMessage::Campaign {
            role: "recover:origin".to_string(),
            candidate: "10.0.0.9:4150".to_string(),
            rnd: 1,
        });

        let err = election.run_election("recover:origin").await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ElectionLost { .. }));
    }

    #[tokio::test]
    async fn test_campaign_grant_first_come_first_served() {
        let election = service().await;

        election.handle_message(ElectionMessage::Campaign {
            role: "recover:a".to_string(),
            candidate: "10.0.0.8:4150".to_string(),
            rnd: 1,
        });
        election.handle_message(ElectionMessage::Campaign {
            role: "recover:a".to_string(),
            candidate: "10.0.0.9:4150".to_string(),
            rnd: 2,
        });

        assert_eq!(election.current_holder("recover:a"), Some("10.0.0.8:4150".to_string()));
    }
}
