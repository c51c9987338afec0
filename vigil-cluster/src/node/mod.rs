//! # Node Assembly
//!
//! Wires the broker, registration database, gossip layer, election
//! service, and auditor into a running node, and owns the long-lived
//! tasks: the gossip receiver, the heartbeat/sweep loop, the seed join
//! loop, the event consumer, the re-gossip ticker, the broker lifecycle
//! forwarder, and the internal audit consumers.

use crate::{
    audit::{AuditDelegate, AuditOp, Auditor, AUDIT_FINISH_TOPIC, AUDIT_SEND_TOPIC, AUDIT_TOPIC_PREFIX},
    config::Config,
    election::ElectionService,
    error::Result,
    gossip::{GossipDelegate, GossipEventPayload, GossipService, Member, MemberEvent},
    registry::{Producer, Registration, RegistrationDb},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use vigil_broker::{Broker, LifecycleEvent, EPHEMERAL_SUFFIX};

fn member_to_producer(member: &Member) -> Arc<Producer> {
    Arc::new(Producer::new(
        member.name.clone(),
        member.gossip_addr.to_string(),
        member.tags.hostname.clone(),
        member.tags.broadcast_address.clone(),
        member.tags.tcp_port,
        member.tags.http_port,
        member.tags.version.clone(),
    ))
}

/// Builder for [`VigilNode`], carrying the optional convergence delegate.
pub struct VigilNodeBuilder {
    config: Config,
    gossip_delegate: Option<Arc<dyn GossipDelegate>>,
}

impl VigilNodeBuilder {
    /// Install a hook notified after each processed gossip event.
    #[must_use]
    pub fn gossip_delegate(mut self, delegate: Arc<dyn GossipDelegate>) -> Self {
        self.gossip_delegate = Some(delegate);
        self
    }

    /// Start the node: bind the gossip socket, wire the audit pipeline,
    /// and spawn every protocol loop.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the gossip
    /// socket cannot be bound.
    pub async fn start(self) -> Result<Arc<VigilNode>> {
        let config = self.config;
        config.validate_config()?;

        let broker = Arc::new(Broker::new());
        let rdb = Arc::new(RegistrationDb::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (audit_op_tx, audit_op_rx) = mpsc::unbounded_channel();

        let gossip = Arc::new(GossipService::bind(config.clone(), event_tx).await?);
        let election = ElectionService::new(
            config.node_name(),
            config.election.timeout(),
            gossip.transport(),
        );
        let auditor = Auditor::new(
            broker.clone(),
            election.clone(),
            config.audit.expiration_time(),
            config.audit.wheel_quantum(),
            shutdown_rx.clone(),
        );
        auditor.set_transport(gossip.transport());

        broker.set_delegate(Arc::new(AuditDelegate::new(
            config.node.hostname.clone(),
            broker.clone(),
            auditor.clone(),
        )));
        broker.set_lifecycle_notifier(lifecycle_tx);

        let node = Arc::new(VigilNode {
            config,
            broker,
            rdb,
            gossip,
            election,
            auditor,
            shutdown: shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        info!(node = %node.config.node_name(), "starting node");

        // the local node registers itself the same way a joining peer
        // would
        node.handle_member_join(&node.gossip.local_member());

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(node.gossip.clone().run_receiver(
            node.election.clone(),
            audit_op_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(node.gossip.clone().run_heartbeat(shutdown_rx.clone())));
        tasks.push(tokio::spawn(node.gossip.clone().run_join_seeds(shutdown_rx.clone())));
        tasks.push(tokio::spawn(node.clone().run_event_loop(
            event_rx,
            self.gossip_delegate,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(node.clone().run_audit_op_loop(audit_op_rx, shutdown_rx.clone())));
        tasks.push(tokio::spawn(node.clone().run_lifecycle_loop(lifecycle_rx, shutdown_rx.clone())));
        tasks.push(tokio::spawn(node.clone().run_regossip_loop(shutdown_rx.clone())));
        tasks.push(tokio::spawn(node.clone().run_audit_send_consumer(shutdown_rx.clone())));
        tasks.push(tokio::spawn(node.clone().run_audit_finish_consumer(shutdown_rx)));
        *node.tasks.lock() = tasks;

        Ok(node)
    }
}

/// A running audit/recovery node.
pub struct VigilNode {
    config: Config,
    broker: Arc<Broker>,
    rdb: Arc<RegistrationDb>,
    gossip: Arc<GossipService>,
    election: Arc<ElectionService>,
    auditor: Arc<Auditor>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VigilNode {
    /// Create a builder for a node with this configuration.
    #[must_use]
    pub fn builder(config: Config) -> VigilNodeBuilder {
        VigilNodeBuilder { config, gossip_delegate: None }
    }

    /// Start a node with this configuration and no delegate.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the gossip
    /// socket cannot be bound.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        Self::builder(config).start().await
    }

    /// The node configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The node's broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// The registration database.
    pub fn registration_db(&self) -> &Arc<RegistrationDb> {
        &self.rdb
    }

    /// The gossip service.
    pub fn gossip(&self) -> &Arc<GossipService> {
        &self.gossip
    }

    /// The auditor.
    pub fn auditor(&self) -> &Arc<Auditor> {
        &self.auditor
    }

    /// The election service.
    pub fn election(&self) -> &Arc<ElectionService> {
        &self.election
    }

    /// Stop every loop and wait for them to exit.
    pub async fn stop(&self) {
        info!(node = %self.config.node_name(), "stopping node");
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    // ---- gossip event handling ------------------------------------------

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MemberEvent>,
        delegate: Option<Arc<dyn GossipDelegate>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        MemberEvent::Join(member) => self.handle_member_join(&member),
                        MemberEvent::Failed(member) => self.handle_member_failed(&member),
                        MemberEvent::User { name, payload } => {
                            self.handle_user_event(&name, &payload);
                        },
                    }
                    if let Some(delegate) = &delegate {
                        delegate.notify();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("event loop exiting");
                        return;
                    }
                }
            }
        }
    }

    fn handle_member_join(&self, member: &Member) {
        let producer = member_to_producer(member);
        let registration = Registration::new("client", "", "");
        if self.rdb.add_producer(registration.clone(), producer) {
            info!("DB: member({}) REGISTER {}", member.name, registration);
        }
    }

    fn handle_member_failed(&self, member: &Member) {
        for registration in self.rdb.lookup_registrations(&member.name) {
            let (removed, _) = self.rdb.remove_producer(&registration, &member.name);
            if removed {
                info!("DB: member({}) UNREGISTER {}", member.name, registration);
            }
        }
    }

    fn handle_user_event(&self, event_name: &str, payload: &[u8]) {
        let event: GossipEventPayload = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "failed to decode gossip event payload");
                return;
            },
        };

        let Some(member) = self.gossip.members().into_iter().find(|m| m.name == event.name)
        else {
            error!(event = event_name, node = %event.name, "received gossip event for unknown node");
            return;
        };
        let producer = member_to_producer(&member);

        match event_name.as_bytes().last().copied() {
            Some(b'+') | Some(b'=') => {
                let touch = event_name.ends_with('=');
                self.handle_create_event(touch, &producer, &event);
            },
            Some(b'-') => self.handle_delete_event(&producer, &event),
            _ => warn!(event = event_name, "un-handled gossip event"),
        }
    }

    fn handle_create_event(
        &self,
        touch: bool,
        producer: &Arc<Producer>,
        event: &GossipEventPayload,
    ) {
        let mut registrations = Vec::new();
        if !event.channel.is_empty() {
            registrations.push(Registration::new("channel", &event.topic, &event.channel));
        }
        registrations.push(Registration::new("topic", &event.topic, ""));

        for registration in registrations {
            if self.rdb.add_producer(registration.clone(), producer.clone()) {
                info!("DB: member({}) REGISTER {}", event.name, registration);
            }
            if touch && self.rdb.touch_producer(&registration, &producer.id) {
                debug!("DB: member({}) TOUCH {}", event.name, registration);
            }
        }
    }

    fn handle_delete_event(&self, producer: &Arc<Producer>, event: &GossipEventPayload) {
        if !event.channel.is_empty() {
            let registration = Registration::new("channel", &event.topic, &event.channel);
            let (removed, remaining) = self.rdb.remove_producer(&registration, &producer.id);
            if removed {
                info!("DB: member({}) UNREGISTER {}", event.name, registration);
            }
            // ephemeral channels with no producers left lose the key
            // entirely
            if remaining == 0 && event.channel.ends_with(EPHEMERAL_SUFFIX) {
                self.rdb.remove_registration(&registration);
            }
            return;
        }

        // a topic unregistration: clear any channel registrations first
        for registration in self.rdb.find_registrations("channel", &event.topic, "*") {
            let (removed, _) = self.rdb.remove_producer(&registration, &producer.id);
            if removed {
                // not expected: channels should have been unregistered
                // individually before their topic
                warn!("client({}) unexpected UNREGISTER {}", event.name, registration);
            }
        }

        let registration = Registration::new("topic", &event.topic, "");
        let (removed, _) = self.rdb.remove_producer(&registration, &producer.id);
        if removed {
            info!("DB: member({}) UNREGISTER {}", event.name, registration);
        }
    }

    // ---- broker lifecycle -> gossip -------------------------------------

    async fn run_lifecycle_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    let (name, topic, channel) = match event {
                        LifecycleEvent::TopicCreated { topic } => ("topic+", topic, String::new()),
                        LifecycleEvent::TopicDeleted { topic } => ("topic-", topic, String::new()),
                        LifecycleEvent::ChannelCreated { topic, channel } => {
                            ("channel+", topic, channel)
                        },
                        LifecycleEvent::ChannelDeleted { topic, channel } => {
                            ("channel-", topic, channel)
                        },
                    };
                    // the internal audit topics are never gossiped
                    if topic.starts_with(AUDIT_TOPIC_PREFIX) {
                        continue;
                    }
                    if let Err(e) = self.gossip.send_user_event(name, &topic, &channel) {
                        error!(error = %e, "failed to send gossip user event");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("lifecycle loop exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn run_regossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gossip.regossip_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first real re-gossip happens one
        // interval from now
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("re-gossiping");
                    for stat in self.broker.stats() {
                        if stat.topic_name.starts_with(AUDIT_TOPIC_PREFIX) {
                            continue;
                        }
                        if stat.channels.is_empty() {
                            // no channels: a bare topic-exists event
                            if let Err(e) =
                                self.gossip.send_user_event("topic=", &stat.topic_name, "")
                            {
                                error!(error = %e, "failed to send gossip user event");
                            }
                            continue;
                        }
                        // channel existence implies topic existence
                        for channel in &stat.channels {
                            if let Err(e) =
                                self.gossip.send_user_event("channel=", &stat.topic_name, channel)
                            {
                                error!(error = %e, "failed to send gossip user event");
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("re-gossip loop exiting");
                        return;
                    }
                }
            }
        }
    }

    // ---- internal audit consumers ---------------------------------------

    fn ephemeral_channel_name(&self) -> String {
        format!("vigil-{}{}", self.config.node.id, EPHEMERAL_SUFFIX)
    }

    async fn run_audit_send_consumer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let channel =
            self.broker.get_topic(AUDIT_SEND_TOPIC).get_channel(&self.ephemeral_channel_name());
        let Some(mut rx) = channel.take_consumer() else {
            error!("audit.send consumer channel already taken");
            return;
        };
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { return };
                    self.auditor.audit(&message);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("audit.send consumer exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn run_audit_finish_consumer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let channel =
            self.broker.get_topic(AUDIT_FINISH_TOPIC).get_channel(&self.ephemeral_channel_name());
        let Some(mut rx) = channel.take_consumer() else {
            error!("audit.finish consumer channel already taken");
            return;
        };
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { return };
                    self.auditor.fin(&message);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("audit.finish consumer exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn run_audit_op_loop(
        self: Arc<Self>,
        mut ops: mpsc::UnboundedReceiver<AuditOp>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                op = ops.recv() => {
                    let Some(op) = op else { return };
                    self.auditor.apply_op(op);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("audit replication loop exiting");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(id: u64) -> Config {
        Config::builder()
            .id(id)
            .hostname(format!("node-{id}"))
            .gossip_address("127.0.0.1:0")
            .broadcast_address("127.0.0.1")
            .tcp_port(9200 + id as u16)
            .heartbeat_interval(Duration::from_millis(100))
            .failure_timeout(Duration::from_millis(1_000))
            .regossip_interval(Duration::from_secs(1))
            .expiration_time(Duration::from_secs(5))
            .wheel_quantum(Duration::from_millis(500))
            .election_timeout(Duration::from_millis(300))
            .build()
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_node_registers_itself_as_client() {
        let node = VigilNode::start(test_config(1)).await.unwrap();

        let producers = node.registration_db().find_producers("client", "", "");
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].id, node.config().node_name());
        assert_eq!(producers[0].tcp_port, 9201);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_topic_and_channel_register_locally() {
        let node = VigilNode::start(test_config(2)).await.unwrap();

        let topic = node.broker().get_topic("topic1");
        topic.get_channel("ch");

        // the local node consumes its own user events
        let ok = wait_until(Duration::from_secs(5), || {
            node.registration_db().find_producers("topic", "topic1", "").len() == 1
                && node.registration_db().find_producers("channel", "topic1", "ch").len() == 1
        })
        .await;
        assert!(ok, "local registrations never appeared");

        node.stop().await;
    }

    #[tokio::test]
    async fn test_ephemeral_channel_cleanup() {
        let node = VigilNode::start(test_config(3)).await.unwrap();

        let topic = node.broker().get_topic("t");
        topic.get_channel("x#ephemeral");

        let ok = wait_until(Duration::from_secs(5), || {
            !node.registration_db().find_registrations("channel", "t", "*").is_empty()
        })
        .await;
        assert!(ok, "channel registration never appeared");

        topic.delete_channel("x#ephemeral");
        let ok = wait_until(Duration::from_secs(5), || {
            node.registration_db().find_registrations("channel", "t", "*").is_empty()
        })
        .await;
        assert!(ok, "ephemeral channel registration was not dropped");

        node.stop().await;
    }

    #[tokio::test]
    async fn test_audit_topics_are_not_gossiped() {
        let node = VigilNode::start(test_config(4)).await.unwrap();

        // publishing forces the audit topics into existence
        node.broker()
            .get_topic("t1")
            .put_message(vigil_core::Message::new(bytes::Bytes::from_static(b"x")));

        let ok = wait_until(Duration::from_secs(5), || {
            node.registration_db().find_producers("topic", "t1", "").len() == 1
        })
        .await;
        assert!(ok);

        assert!(node.registration_db().find_producers("topic", AUDIT_SEND_TOPIC, "").is_empty());
        assert!(node.registration_db().find_producers("topic", AUDIT_FINISH_TOPIC, "").is_empty());

        node.stop().await;
    }
}
