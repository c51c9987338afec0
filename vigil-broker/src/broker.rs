//! In-memory message broker with lifecycle hooks.
//!
//! Topics fan messages out to their channels; each channel is an
//! independently consumable copy of the topic stream. Topic and channel
//! creation/deletion are reported on a lifecycle event channel so the
//! cluster layer can gossip existence events, and every message lifecycle
//! transition is reported to the installed [`MessageDelegate`].

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vigil_core::{Message, MessageId};

/// Channel name suffix marking an ephemeral subscription.
///
/// An ephemeral channel's registration is dropped as soon as its last
/// producer leaves.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Message lifecycle hooks consumed by the audit layer.
///
/// The broker calls these synchronously on the publishing/acknowledging
/// task; implementations must not block.
pub trait MessageDelegate: Send + Sync {
    /// Called before a message enters a topic.
    fn on_queue(&self, message: &Message, topic: &str);

    /// Called when a message is acknowledged (FIN).
    fn on_finish(&self, message: &Message);

    /// Called when a message is requeued (REQ).
    fn on_requeue(&self, message: &Message, delay: Duration);

    /// Called when a message's in-flight deadline is extended (TOUCH).
    fn on_touch(&self, message: &Message);
}

/// Topic and channel existence transitions, reported to the cluster layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A topic was created.
    TopicCreated {
        /// Topic name
        topic: String,
    },
    /// A topic was deleted.
    TopicDeleted {
        /// Topic name
        topic: String,
    },
    /// A channel was created on a topic.
    ChannelCreated {
        /// Owning topic name
        topic: String,
        /// Channel name
        channel: String,
    },
    /// A channel was deleted from a topic.
    ChannelDeleted {
        /// Owning topic name
        topic: String,
        /// Channel name
        channel: String,
    },
}

/// Per-topic statistics snapshot, used by the re-gossip loop.
#[derive(Debug, Clone)]
pub struct TopicStats {
    /// Topic name
    pub topic_name: String,
    /// Names of the topic's channels
    pub channels: Vec<String>,
}

type DelegateSlot = RwLock<Option<Arc<dyn MessageDelegate>>>;
type LifecycleSlot = RwLock<Option<mpsc::UnboundedSender<LifecycleEvent>>>;

/// A consumable copy of a topic's message stream.
pub struct Channel {
    name: String,
    topic_name: String,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    depth: AtomicU64,
}

impl Channel {
    fn new(topic_name: &str, name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            topic_name: topic_name.to_string(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            depth: AtomicU64::new(0),
        }
    }

    /// Get the channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the owning topic name.
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Whether this channel is ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.name.ends_with(EPHEMERAL_SUFFIX)
    }

    /// Number of messages put into this channel so far.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Take the consumer half of this channel.
    ///
    /// Each channel supports a single consumer; subsequent calls return
    /// `None`.
    pub fn take_consumer(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.receiver.lock().take()
    }

    fn put(&self, message: Message) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(message).is_err() {
            warn!(topic = %self.topic_name, channel = %self.name, "channel consumer dropped");
        }
    }
}

/// A named message stream fanning out to channels.
pub struct Topic {
    name: String,
    channels: DashMap<String, Arc<Channel>>,
    // messages published before the first channel exists are retained and
    // drained into that channel
    pending: Mutex<Vec<Message>>,
    delegate: Arc<DelegateSlot>,
    lifecycle: Arc<LifecycleSlot>,
    messages_put: AtomicU64,
}

impl Topic {
    fn new(name: &str, delegate: Arc<DelegateSlot>, lifecycle: Arc<LifecycleSlot>) -> Self {
        Self {
            name: name.to_string(),
            channels: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            delegate,
            lifecycle,
            messages_put: AtomicU64::new(0),
        }
    }

    /// Get the topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a message into this topic.
    ///
    /// The installed delegate's `on_queue` fires before the message is
    /// fanned out to channels.
    pub fn put_message(&self, message: Message) {
        // the guard is released before the hook runs so delegates may
        // publish back into the broker
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_queue(&message, &self.name);
        }

        self.messages_put.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %self.name, id = %message.id, "put message");

        if self.channels.is_empty() {
            self.pending.lock().push(message);
            return;
        }
        for channel in self.channels.iter() {
            channel.value().put(message.clone());
        }
    }

    /// Get a channel by name, creating it if absent.
    pub fn get_channel(&self, name: &str) -> Arc<Channel> {
        if let Some(existing) = self.channels.get(name) {
            return existing.value().clone();
        }

        let channel = Arc::new(Channel::new(&self.name, name));
        self.channels.insert(name.to_string(), channel.clone());

        // first channel inherits anything published before it existed
        let backlog: Vec<Message> = std::mem::take(&mut *self.pending.lock());
        for message in backlog {
            channel.put(message);
        }

        self.notify(LifecycleEvent::ChannelCreated {
            topic: self.name.clone(),
            channel: name.to_string(),
        });
        channel
    }

    /// Delete a channel by name. Returns whether it existed.
    pub fn delete_channel(&self, name: &str) -> bool {
        let removed = self.channels.remove(name).is_some();
        if removed {
            self.notify(LifecycleEvent::ChannelDeleted {
                topic: self.name.clone(),
                channel: name.to_string(),
            });
        }
        removed
    }

    /// Names of this topic's channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Total messages put into this topic.
    pub fn message_count(&self) -> u64 {
        self.messages_put.load(Ordering::Relaxed)
    }

    fn notify(&self, event: LifecycleEvent) {
        let tx = self.lifecycle.read().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }
}

/// In-memory message broker.
///
/// Holds the topic map, the delegate slot, and the lifecycle notification
/// channel. One broker instance exists per node.
pub struct Broker {
    topics: DashMap<String, Arc<Topic>>,
    delegate: Arc<DelegateSlot>,
    lifecycle: Arc<LifecycleSlot>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Create a new broker with no delegate installed.
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            delegate: Arc::new(RwLock::new(None)),
            lifecycle: Arc::new(RwLock::new(None)),
        }
    }

    /// Generate a fresh cluster-unique message ID.
    pub fn new_id(&self) -> MessageId {
        MessageId::new()
    }

    /// Install the message lifecycle delegate.
    pub fn set_delegate(&self, delegate: Arc<dyn MessageDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Install the topic/channel lifecycle notification channel.
    pub fn set_lifecycle_notifier(&self, tx: mpsc::UnboundedSender<LifecycleEvent>) {
        *self.lifecycle.write() = Some(tx);
    }

    /// Get a topic by name, creating it if absent.
    pub fn get_topic(&self, name: &str) -> Arc<Topic> {
        if let Some(existing) = self.topics.get(name) {
            return existing.value().clone();
        }

        let topic = Arc::new(Topic::new(name, self.delegate.clone(), self.lifecycle.clone()));
        self.topics.insert(name.to_string(), topic.clone());
        debug!(topic = %name, "created topic");

        let tx = self.lifecycle.read().clone();
        if let Some(tx) = tx {
            let _ = tx.send(LifecycleEvent::TopicCreated { topic: name.to_string() });
        }
        topic
    }

    /// Get an existing topic without creating it.
    pub fn get_existing_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|e| e.value().clone())
    }

    /// Delete a topic by name. Returns whether it existed.
    pub fn delete_topic(&self, name: &str) -> bool {
        let removed = self.topics.remove(name).is_some();
        if removed {
            let tx = self.lifecycle.read().clone();
            if let Some(tx) = tx {
                let _ = tx.send(LifecycleEvent::TopicDeleted { topic: name.to_string() });
            }
        }
        removed
    }

    /// Report a FIN for a message to the delegate.
    pub fn finish_message(&self, message: &Message) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_finish(message);
        }
    }

    /// Report a REQ for a message to the delegate.
    pub fn requeue_message(&self, message: &Message, delay: Duration) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_requeue(message, delay);
        }
    }

    /// Report a TOUCH for a message to the delegate.
    pub fn touch_message(&self, message: &Message) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_touch(message);
        }
    }

    /// Snapshot of all topics and their channels.
    pub fn stats(&self) -> Vec<TopicStats> {
        self.topics
            .iter()
            .map(|e| TopicStats {
                topic_name: e.key().clone(),
                channels: e.value().channel_names(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingDelegate {
        queued: PlMutex<Vec<(MessageId, String)>>,
        finished: PlMutex<Vec<MessageId>>,
    }

    impl MessageDelegate for RecordingDelegate {
        fn on_queue(&self, message: &Message, topic: &str) {
            self.queued.lock().push((message.id, topic.to_string()));
        }
        fn on_finish(&self, message: &Message) {
            self.finished.lock().push(message.id);
        }
        fn on_requeue(&self, _message: &Message, _delay: Duration) {}
        fn on_touch(&self, _message: &Message) {}
    }

    #[tokio::test]
    async fn test_fanout_to_channels() {
        let broker = Broker::new();
        let topic = broker.get_topic("t1");
        let ch_a = topic.get_channel("a");
        let ch_b = topic.get_channel("b");
        let mut rx_a = ch_a.take_consumer().unwrap();
        let mut rx_b = ch_b.take_consumer().unwrap();

        let m = Message::new(Bytes::from_static(b"x"));
        topic.put_message(m.clone());

        assert_eq!(rx_a.recv().await.unwrap().id, m.id);
        assert_eq!(rx_b.recv().await.unwrap().id, m.id);
    }

    #[tokio::test]
    async fn test_pending_drained_into_first_channel() {
        let broker = Broker::new();
        let topic = broker.get_topic("t1");

        let m = Message::new(Bytes::from_static(b"x"));
        topic.put_message(m.clone());

        let ch = topic.get_channel("late");
        let mut rx = ch.take_consumer().unwrap();
        assert_eq!(rx.recv().await.unwrap().id, m.id);
    }

    #[test]
    fn test_delegate_hooks_fire() {
        let broker = Broker::new();
        let delegate = Arc::new(RecordingDelegate::default());
        broker.set_delegate(delegate.clone());

        let m = Message::new(Bytes::from_static(b"x"));
        broker.get_topic("t1").put_message(m.clone());
        broker.finish_message(&m);

        assert_eq!(delegate.queued.lock().as_slice(), &[(m.id, "t1".to_string())]);
        assert_eq!(delegate.finished.lock().as_slice(), &[m.id]);
    }

    #[test]
    fn test_lifecycle_events() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.set_lifecycle_notifier(tx);

        let topic = broker.get_topic("t1");
        topic.get_channel("ch");
        topic.delete_channel("ch");
        broker.delete_topic("t1");

        assert_eq!(rx.try_recv().unwrap(), LifecycleEvent::TopicCreated { topic: "t1".into() });
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::ChannelCreated { topic: "t1".into(), channel: "ch".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::ChannelDeleted { topic: "t1".into(), channel: "ch".into() }
        );
        assert_eq!(rx.try_recv().unwrap(), LifecycleEvent::TopicDeleted { topic: "t1".into() });
    }

    #[test]
    fn test_ephemeral_suffix() {
        let broker = Broker::new();
        let topic = broker.get_topic("t1");
        assert!(topic.get_channel("x#ephemeral").is_ephemeral());
        assert!(!topic.get_channel("x").is_ephemeral());
    }

    #[test]
    fn test_stats() {
        let broker = Broker::new();
        broker.get_topic("t1").get_channel("ch");
        broker.get_topic("t2");

        let mut stats = broker.stats();
        stats.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].channels, vec!["ch".to_string()]);
        assert!(stats[1].channels.is_empty());
    }
}
