//! # Per-Host Expiry Wheel
//!
//! A bucketed timer structure partitioning outstanding messages by rounded
//! expiration instant. Moves, inserts, and removals are O(1); when the
//! earliest bucket elapses with messages still in it, the host's recovery
//! trigger fires.
//!
//! Each [`Host`] owns a chain of [`Bucket`]s ordered by expiration, an
//! index from rounded instant to bucket, and a reverse index from message
//! ID to bucket so any message can be located and removed in O(1). The
//! reverse index is authoritative: recovery reads messages only through
//! it, which absorbs races between concurrent rescheduling and bucket
//! expiry.

use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, trace};
use vigil_core::{Message, MessageId};

/// Callback fired when a host's bucket expires non-empty.
///
/// Implementations must not block; recovery work is expected to be
/// spawned so the expiry loop keeps ticking.
pub trait RecoveryTrigger: Send + Sync {
    /// A non-empty bucket belonging to `host` has expired.
    fn initiate_recovery(&self, host: &Arc<Host>);
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A time-quantized container of outstanding audit entries sharing the
/// same rounded deadline.
pub struct Bucket {
    expiration_ms: i64,
    messages: Mutex<HashMap<MessageId, Message>>,
    next: Mutex<Option<Arc<Bucket>>>,
}

impl Bucket {
    fn new(expiration_ms: i64) -> Self {
        Self { expiration_ms, messages: Mutex::new(HashMap::new()), next: Mutex::new(None) }
    }

    /// Rounded expiration instant, in unix milliseconds.
    pub fn expiration_ms(&self) -> i64 {
        self.expiration_ms
    }

    /// Fetch a message stored in this bucket.
    pub fn get_message(&self, id: &MessageId) -> Option<Message> {
        self.messages.lock().get(id).cloned()
    }

    /// Whether this bucket currently holds any messages.
    pub fn has_messages(&self) -> bool {
        !self.messages.lock().is_empty()
    }

    fn take_next(&self) -> Option<Arc<Bucket>> {
        self.next.lock().take()
    }

    fn set_next(&self, bucket: Arc<Bucket>) {
        *self.next.lock() = Some(bucket);
    }

    fn next(&self) -> Option<Arc<Bucket>> {
        self.next.lock().clone()
    }
}

struct Wheel {
    buckets: HashMap<i64, Arc<Bucket>>,
    head: Arc<Bucket>,
}

impl Wheel {
    fn new(head_ms: i64) -> Self {
        let head = Arc::new(Bucket::new(head_ms));
        let mut buckets = HashMap::new();
        buckets.insert(head_ms, head.clone());
        Self { buckets, head }
    }

    // Returns the bucket for `rounded_ms`, creating it (and any missing
    // intermediate buckets back to its predecessor) if absent. The whole
    // stitch runs under the wheel lock, so the chain invariant holds:
    // expirations strictly increase along `next`.
    fn bucket_at(&mut self, rounded_ms: i64, quantum_ms: i64) -> Arc<Bucket> {
        if let Some(existing) = self.buckets.get(&rounded_ms) {
            return existing.clone();
        }

        let bucket = Arc::new(Bucket::new(rounded_ms));
        self.buckets.insert(rounded_ms, bucket.clone());

        if rounded_ms < self.head.expiration_ms {
            // new earliest bucket becomes the head
            bucket.set_next(self.head.clone());
            self.head = bucket.clone();
        } else {
            // the head is always present in the map, so this walk
            // terminates at or before it
            let prev = self.bucket_at(rounded_ms - quantum_ms, quantum_ms);
            if let Some(old_next) = prev.next() {
                bucket.set_next(old_next);
            }
            prev.set_next(bucket.clone());
        }

        bucket
    }
}

/// Per-originating-hostname expiry record.
///
/// Hosts are created lazily on first reference and live for the process
/// lifetime.
pub struct Host {
    hostname: String,
    quantum: Duration,
    wheel: Mutex<Wheel>,
    messages: Mutex<HashMap<MessageId, Arc<Bucket>>>,
    in_recovery: AtomicBool,
}

impl Host {
    /// Create an empty host with the head bucket positioned at now,
    /// rounded to the wheel quantum.
    pub fn new(hostname: impl Into<String>, quantum: Duration) -> Self {
        let quantum_ms = quantum.as_millis() as i64;
        let head_ms = round_to_quantum(now_millis(), quantum_ms);
        Self {
            hostname: hostname.into(),
            quantum,
            wheel: Mutex::new(Wheel::new(head_ms)),
            messages: Mutex::new(HashMap::new()),
            in_recovery: AtomicBool::new(false),
        }
    }

    /// The hostname this wheel audits.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The election role name for recovering this host.
    pub fn recovery_topic(&self) -> String {
        format!("recover:{}", self.hostname)
    }

    /// The bucket whose rounded expiration equals `round(at_ms)`,
    /// created if absent.
    pub fn bucket_at_expire_time(&self, at_ms: i64) -> Arc<Bucket> {
        let quantum_ms = self.quantum.as_millis() as i64;
        let rounded = round_to_quantum(at_ms, quantum_ms);
        self.wheel.lock().bucket_at(rounded, quantum_ms)
    }

    /// Schedule `message` to expire at `at_ms`, removing any prior
    /// placement first (a message may be rescheduled by touch/requeue).
    pub fn add_message(&self, message: Message, at_ms: i64) {
        self.remove_message(&message.id);

        let bucket = self.bucket_at_expire_time(at_ms);
        let mut index = self.messages.lock();
        bucket.messages.lock().insert(message.id, message.clone());
        index.insert(message.id, bucket);
        trace!(host = %self.hostname, id = %message.id, at_ms, "scheduled message");
    }

    /// Remove a message from its bucket and the reverse index. A no-op
    /// if the ID is unknown.
    pub fn remove_message(&self, id: &MessageId) {
        let mut index = self.messages.lock();
        if let Some(bucket) = index.remove(id) {
            bucket.messages.lock().remove(id);
            trace!(host = %self.hostname, id = %id, "removed message");
        }
    }

    /// Snapshot copy of the reverse index.
    pub fn get_messages(&self) -> HashMap<MessageId, Arc<Bucket>> {
        self.messages.lock().clone()
    }

    /// Number of outstanding messages for this host.
    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Atomically set the recovery state. Returns true iff the value
    /// changed, guarding against overlapping recoveries.
    pub fn set_recovery(&self, desired: bool) -> bool {
        self.in_recovery
            .compare_exchange(!desired, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a recovery is currently in flight.
    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    /// Expirations along the bucket chain starting at the head. Used to
    /// check the wheel's monotonicity invariant.
    pub fn chain_expirations(&self) -> Vec<i64> {
        let wheel = self.wheel.lock();
        let mut out = vec![wheel.head.expiration_ms];
        let mut cursor = wheel.head.next();
        while let Some(bucket) = cursor {
            out.push(bucket.expiration_ms);
            cursor = bucket.next();
        }
        out
    }

    // Detach the head bucket, advance the head to its successor (creating
    // an empty successor when the chain is exhausted), and return the
    // detached bucket.
    fn advance(&self) -> Arc<Bucket> {
        let quantum_ms = self.quantum.as_millis() as i64;
        let mut wheel = self.wheel.lock();
        let expired = wheel.head.clone();
        wheel.buckets.remove(&expired.expiration_ms);
        wheel.head = match expired.take_next() {
            Some(next) => next,
            None => {
                let succ_ms = expired.expiration_ms + quantum_ms;
                let succ = Arc::new(Bucket::new(succ_ms));
                wheel.buckets.insert(succ_ms, succ.clone());
                succ
            },
        };
        expired
    }

    /// Expiry loop: every quantum the earliest bucket is detached and, if
    /// it still holds messages, `trigger` fires. Terminates when
    /// `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        trigger: Arc<dyn RecoveryTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.quantum);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.advance();
                    if expired.has_messages() {
                        debug!(host = %self.hostname, "bucket expired with outstanding messages");
                        trigger.initiate_recovery(&self);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(host = %self.hostname, "expiry loop exiting");
                        return;
                    }
                }
            }
        }
    }
}

/// Round to the nearest quantum multiple; ties break toward the later
/// bucket.
fn round_to_quantum(ms: i64, quantum_ms: i64) -> i64 {
    debug_assert!(quantum_ms > 0);
    ((ms + quantum_ms / 2).div_euclid(quantum_ms)) * quantum_ms
}

/// Process-wide mapping `hostname -> Host`, with lazy creation.
pub struct HostSet {
    quantum: Duration,
    hosts: Mutex<HashMap<String, Arc<Host>>>,
}

impl HostSet {
    /// Create an empty host set whose hosts use `quantum` for their
    /// wheels.
    pub fn new(quantum: Duration) -> Self {
        Self { quantum, hosts: Mutex::new(HashMap::new()) }
    }

    /// Look up a host, creating it on first reference. Returns the host
    /// and whether it was just created (so the caller can start its
    /// expiry loop exactly once).
    pub fn get_or_create(&self, hostname: &str) -> (Arc<Host>, bool) {
        let mut hosts = self.hosts.lock();
        if let Some(existing) = hosts.get(hostname) {
            return (existing.clone(), false);
        }
        let host = Arc::new(Host::new(hostname, self.quantum));
        hosts.insert(hostname.to_string(), host.clone());
        (host, true)
    }

    /// Look up a host without creating it.
    pub fn get(&self, hostname: &str) -> Option<Arc<Host>> {
        self.hosts.lock().get(hostname).cloned()
    }

    /// All hosts currently tracked.
    pub fn all(&self) -> Vec<Arc<Host>> {
        self.hosts.lock().values().cloned().collect()
    }
}
