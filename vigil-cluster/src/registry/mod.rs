//! # Registration Database
//!
//! Thread-safe in-memory map from a `(category, key, subkey)` registration
//! tuple to a set of producer records, with wildcard lookup, tombstoning,
//! and activity filtering.
//!
//! The database is a materialized view of gossip events: it is only
//! mutated by membership and user-event handlers and by the re-gossip
//! emitter, so divergence between peers is bounded by one re-gossip
//! interval.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Wildcard matching any key or subkey.
pub const WILDCARD: &str = "*";

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// A `(category, key, subkey)` tuple identifying a namespace producers
/// bind to.
///
/// The tuple is the sole identity of a registration; equality is
/// structural. Categories in use: `"client"` (empty key/subkey),
/// `"topic"` (key = topic), `"channel"` (key = topic, subkey = channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Registration {
    /// Registration category
    pub category: String,
    /// Primary key (topic name, or empty)
    pub key: String,
    /// Secondary key (channel name, or empty)
    pub sub_key: String,
}

impl Registration {
    /// Create a new registration tuple.
    pub fn new(
        category: impl Into<String>,
        key: impl Into<String>,
        sub_key: impl Into<String>,
    ) -> Self {
        Self { category: category.into(), key: key.into(), sub_key: sub_key.into() }
    }

    /// Whether this registration matches a query.
    ///
    /// `category` is always exact; `key` and `subkey` match anything when
    /// they are [`WILDCARD`].
    pub fn is_match(&self, category: &str, key: &str, sub_key: &str) -> bool {
        if category != self.category {
            return false;
        }
        if key != WILDCARD && self.key != key {
            return false;
        }
        if sub_key != WILDCARD && self.sub_key != sub_key {
            return false;
        }
        true
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "category:{} key:{} subkey:{}", self.category, self.key, self.sub_key)
    }
}

/// A cluster peer capable of originating messages on a topic/channel.
///
/// `last_update` is touched under the database's read lock using an atomic
/// store, so parallel touches of distinct producers do not serialize on
/// the writer lock.
#[derive(Debug)]
pub struct Producer {
    /// Stable peer identifier (the gossip node name)
    pub id: String,
    /// Remote gossip address the peer was heard from
    pub remote_address: String,
    /// Peer hostname
    pub hostname: String,
    /// Address the peer advertises to clients
    pub broadcast_address: String,
    /// Advertised TCP port
    pub tcp_port: u16,
    /// Advertised HTTP port
    pub http_port: u16,
    /// Peer version string
    pub version: String,
    last_update: AtomicI64,
    tombstoned: AtomicBool,
    tombstoned_at: AtomicI64,
}

impl Producer {
    /// Create a new producer record, last heard from now.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        remote_address: impl Into<String>,
        hostname: impl Into<String>,
        broadcast_address: impl Into<String>,
        tcp_port: u16,
        http_port: u16,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            remote_address: remote_address.into(),
            hostname: hostname.into(),
            broadcast_address: broadcast_address.into(),
            tcp_port,
            http_port,
            version: version.into(),
            last_update: AtomicI64::new(now_nanos()),
            tombstoned: AtomicBool::new(false),
            tombstoned_at: AtomicI64::new(0),
        }
    }

    /// Nanosecond timestamp of the last update.
    pub fn last_update(&self) -> i64 {
        self.last_update.load(Ordering::Relaxed)
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_update.store(now_nanos(), Ordering::Relaxed);
    }

    /// Soft-delete this producer.
    pub fn tombstone(&self) {
        self.tombstoned.store(true, Ordering::Relaxed);
        self.tombstoned_at.store(now_nanos(), Ordering::Relaxed);
    }

    /// Whether the producer is tombstoned and the tombstone is still
    /// within its lifetime.
    pub fn is_tombstoned(&self, lifetime: Duration) -> bool {
        if !self.tombstoned.load(Ordering::Relaxed) {
            return false;
        }
        let elapsed = now_nanos().saturating_sub(self.tombstoned_at.load(Ordering::Relaxed));
        elapsed < lifetime.as_nanos() as i64
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {}]", self.broadcast_address, self.tcp_port, self.http_port)
    }
}

/// Keep only producers heard from within `inactivity_timeout` whose
/// tombstone, if any, has expired.
pub fn filter_active(
    producers: &[Arc<Producer>],
    inactivity_timeout: Duration,
    tombstone_lifetime: Duration,
) -> Vec<Arc<Producer>> {
    let now = now_nanos();
    producers
        .iter()
        .filter(|p| {
            let idle = now.saturating_sub(p.last_update());
            idle <= inactivity_timeout.as_nanos() as i64 && !p.is_tombstoned(tombstone_lifetime)
        })
        .cloned()
        .collect()
}

/// Snapshot entry produced by [`RegistrationDb::debug_dump`].
#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    /// Peer identifier
    pub id: String,
    /// Peer hostname
    pub hostname: String,
    /// Advertised broadcast address
    pub broadcast_address: String,
    /// Advertised TCP port
    pub tcp_port: u16,
    /// Advertised HTTP port
    pub http_port: u16,
    /// Peer version string
    pub version: String,
    /// Nanosecond timestamp of the last update
    pub last_update: i64,
}

/// Thread-safe mapping `Registration -> set of Producers`.
///
/// Producer sets are unique by producer ID. A single reader-preferring
/// lock gates all structural access; readers run in parallel, writers are
/// exclusive.
pub struct RegistrationDb {
    data: RwLock<HashMap<Registration, Vec<Arc<Producer>>>>,
}

impl Default for RegistrationDb {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationDb {
    /// Create an empty registration database.
    pub fn new() -> Self {
        Self { data: RwLock::new(HashMap::new()) }
    }

    /// Ensure a registration key exists, with an empty producer set if new.
    pub fn add_registration(&self, k: Registration) {
        self.data.write().entry(k).or_default();
    }

    /// Add a producer to a registration.
    ///
    /// Returns whether a new insertion occurred; adding a producer whose
    /// ID is already present is an idempotent no-op.
    pub fn add_producer(&self, k: Registration, p: Arc<Producer>) -> bool {
        let mut data = self.data.write();
        let producers = data.entry(k).or_default();
        if producers.iter().any(|existing| existing.id == p.id) {
            return false;
        }
        producers.push(p);
        true
    }

    /// Remove at most one producer with the given ID from a registration.
    ///
    /// Returns whether a removal occurred and the post-removal producer
    /// count. The key stays present even when its set becomes empty.
    pub fn remove_producer(&self, k: &Registration, id: &str) -> (bool, usize) {
        let mut data = self.data.write();
        let Some(producers) = data.get_mut(k) else {
            return (false, 0);
        };
        let before = producers.len();
        producers.retain(|p| p.id != id);
        (producers.len() < before, producers.len())
    }

    /// Remove a registration key and all of its producers.
    pub fn remove_registration(&self, k: &Registration) {
        self.data.write().remove(k);
    }

    /// All registrations matching the query. Wildcard `"*"` in `key` or
    /// `sub_key` matches anything; `category` is exact.
    pub fn find_registrations(&self, category: &str, key: &str, sub_key: &str) -> Vec<Registration> {
        self.data
            .read()
            .keys()
            .filter(|k| k.is_match(category, key, sub_key))
            .cloned()
            .collect()
    }

    /// All producers under registrations matching the query, deduplicated
    /// by producer ID. Result ordering is unspecified.
    pub fn find_producers(&self, category: &str, key: &str, sub_key: &str) -> Vec<Arc<Producer>> {
        let data = self.data.read();
        let mut results: Vec<Arc<Producer>> = Vec::new();
        for (k, producers) in data.iter() {
            if !k.is_match(category, key, sub_key) {
                continue;
            }
            for producer in producers {
                if !results.iter().any(|p| p.id == producer.id) {
                    results.push(producer.clone());
                }
            }
        }
        results
    }

    /// All registration keys containing a producer with this ID.
    pub fn lookup_registrations(&self, id: &str) -> Vec<Registration> {
        self.data
            .read()
            .iter()
            .filter(|(_, producers)| producers.iter().any(|p| p.id == id))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Update a producer's `last_update` to now.
    ///
    /// Runs under the read lock; the timestamp itself is an atomic store.
    /// Returns whether the producer was present.
    pub fn touch_producer(&self, k: &Registration, id: &str) -> bool {
        let data = self.data.read();
        let Some(producers) = data.get(k) else {
            return false;
        };
        match producers.iter().find(|p| p.id == id) {
            Some(p) => {
                p.touch();
                true
            },
            None => false,
        }
    }

    /// Serializable snapshot of the whole database, keyed
    /// `category:key:subkey`.
    pub fn debug_dump(&self) -> HashMap<String, Vec<ProducerSnapshot>> {
        let data = self.data.read();
        data.iter()
            .map(|(k, producers)| {
                let key = format!("{}:{}:{}", k.category, k.key, k.sub_key);
                let snapshots = producers
                    .iter()
                    .map(|p| ProducerSnapshot {
                        id: p.id.clone(),
                        hostname: p.hostname.clone(),
                        broadcast_address: p.broadcast_address.clone(),
                        tcp_port: p.tcp_port,
                        http_port: p.http_port,
                        version: p.version.clone(),
                        last_update: p.last_update(),
                    })
                    .collect();
                (key, snapshots)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(id: &str) -> Arc<Producer> {
        Arc::new(Producer::new(
            id,
            "127.0.0.1:4160",
            "test-host",
            "127.0.0.1",
            4150,
            4151,
            "1.0.0",
        ))
    }

    #[test]
    fn test_add_registration_creates_empty_key() {
        let db = RegistrationDb::new();
        let k = Registration::new("topic", "t1", "");
        db.add_registration(k.clone());

        assert_eq!(db.find_registrations("topic", "t1", ""), vec![k.clone()]);
        assert!(db.find_producers("topic", "t1", "").is_empty());

        // adding the key again does not disturb existing producers
        db.add_producer(k.clone(), producer("a"));
        db.add_registration(k.clone());
        assert_eq!(db.find_producers("topic", "t1", "").len(), 1);
    }

    #[test]
    fn test_add_producer_idempotent() {
        let db = RegistrationDb::new();
        let k = Registration::new("topic", "t1", "");

        assert!(db.add_producer(k.clone(), producer("a")));
        assert!(!db.add_producer(k.clone(), producer("a")));
        assert_eq!(db.find_producers("topic", "t1", "").len(), 1);
    }

    #[test]
    fn test_remove_leaves_key() {
        let db = RegistrationDb::new();
        let k = Registration::new("channel", "t1", "ch");
        db.add_producer(k.clone(), producer("a"));

        let (removed, remaining) = db.remove_producer(&k, "a");
        assert!(removed);
        assert_eq!(remaining, 0);
        assert_eq!(db.find_registrations("channel", "t1", "*"), vec![k.clone()]);

        let (removed, remaining) = db.remove_producer(&k, "a");
        assert!(!removed);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_remove_registration_drops_key() {
        let db = RegistrationDb::new();
        let k = Registration::new("channel", "t1", "ch#ephemeral");
        db.add_producer(k.clone(), producer("a"));
        db.remove_registration(&k);
        assert!(db.find_registrations("channel", "t1", "*").is_empty());
    }

    #[test]
    fn test_wildcard_matching() {
        let db = RegistrationDb::new();
        db.add_producer(Registration::new("channel", "t1", "a"), producer("p1"));
        db.add_producer(Registration::new("channel", "t1", "b"), producer("p2"));
        db.add_producer(Registration::new("channel", "t2", "a"), producer("p3"));
        db.add_producer(Registration::new("topic", "t1", ""), producer("p1"));

        assert_eq!(db.find_registrations("channel", "t1", "*").len(), 2);
        assert_eq!(db.find_registrations("channel", "*", "a").len(), 2);
        assert_eq!(db.find_registrations("channel", "*", "*").len(), 3);
        assert_eq!(db.find_registrations("topic", "t1", "").len(), 1);
        // category never matches a wildcard
        assert!(db.find_registrations("*", "*", "*").is_empty());
    }

    #[test]
    fn test_wildcard_subsumption() {
        let db = RegistrationDb::new();
        db.add_producer(Registration::new("channel", "t1", "a"), producer("p1"));
        db.add_producer(Registration::new("channel", "t2", "b"), producer("p2"));

        let all: Vec<String> =
            db.find_producers("channel", "*", "*").iter().map(|p| p.id.clone()).collect();
        for p in db.find_producers("channel", "t1", "a") {
            assert!(all.contains(&p.id));
        }
    }

    #[test]
    fn test_find_producers_dedupes_by_id() {
        let db = RegistrationDb::new();
        db.add_producer(Registration::new("channel", "t1", "a"), producer("p1"));
        db.add_producer(Registration::new("channel", "t1", "b"), producer("p1"));
        assert_eq!(db.find_producers("channel", "t1", "*").len(), 1);
    }

    #[test]
    fn test_lookup_registrations() {
        let db = RegistrationDb::new();
        db.add_producer(Registration::new("client", "", ""), producer("p1"));
        db.add_producer(Registration::new("topic", "t1", ""), producer("p1"));
        db.add_producer(Registration::new("topic", "t2", ""), producer("p2"));

        let mut found = db.lookup_registrations("p1");
        found.sort_by(|a, b| a.category.cmp(&b.category));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].category, "client");
        assert_eq!(found[1].category, "topic");
    }

    #[test]
    fn test_touch_producer() {
        let db = RegistrationDb::new();
        let k = Registration::new("topic", "t1", "");
        let p = producer("p1");
        let before = p.last_update();
        db.add_producer(k.clone(), p.clone());

        std::thread::sleep(Duration::from_millis(5));
        assert!(db.touch_producer(&k, "p1"));
        assert!(p.last_update() > before);
        assert!(!db.touch_producer(&k, "missing"));
        assert!(!db.touch_producer(&Registration::new("topic", "other", ""), "p1"));
    }

    #[test]
    fn test_filter_active_tombstone() {
        let p = producer("p1");
        let active = filter_active(
            &[p.clone()],
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(active.len(), 1);

        p.tombstone();
        let active = filter_active(
            &[p.clone()],
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(active.is_empty());

        // an expired tombstone no longer suppresses the producer
        let active = filter_active(&[p], Duration::from_secs(60), Duration::from_nanos(1));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_registration_display() {
        let k = Registration::new("channel", "t1", "ch");
        assert_eq!(k.to_string(), "category:channel key:t1 subkey:ch");
    }
}
