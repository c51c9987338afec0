//! Shared harness for multi-node integration tests: short timers, seeded
//! cluster startup, and convergence waiting driven by the gossip
//! delegate.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use vigil_cluster::{Config, GossipDelegate, VigilNode};

/// Gossip delegate that wakes the convergence waiter after every
/// processed event.
#[derive(Default)]
pub struct ConvergenceNotifier {
    notify: Notify,
}

impl ConvergenceNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl GossipDelegate for ConvergenceNotifier {
    fn notify(&self) {
        self.notify.notify_one();
    }
}

/// A node configuration with timers shortened for tests.
pub fn test_config(id: u64, tcp_base: u16) -> Config {
    Config::builder()
        .id(id)
        .hostname(format!("node-{id}"))
        .gossip_address("127.0.0.1:0")
        .broadcast_address("127.0.0.1")
        .tcp_port(tcp_base + id as u16)
        .heartbeat_interval(Duration::from_millis(100))
        .failure_timeout(Duration::from_millis(1_000))
        .regossip_interval(Duration::from_millis(1_000))
        .join_retry_interval(Duration::from_millis(500))
        .wheel_quantum(Duration::from_millis(250))
        .expiration_time(Duration::from_millis(1_500))
        .election_timeout(Duration::from_millis(400))
        .build()
        .unwrap()
}

/// Start `n` nodes, the first acting as the seed for the rest.
pub async fn start_cluster(
    n: u64,
    tcp_base: u16,
    tester: &Arc<ConvergenceNotifier>,
) -> Vec<Arc<VigilNode>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut nodes: Vec<Arc<VigilNode>> = Vec::new();
    for id in 0..n {
        let mut config = test_config(id, tcp_base);
        if let Some(seed) = nodes.first() {
            config.gossip.seed_addresses =
                vec![seed.gossip().local_member().gossip_addr.to_string()];
        }
        let node = VigilNode::builder(config)
            .gossip_delegate(tester.clone())
            .start()
            .await
            .unwrap();
        nodes.push(node);
    }
    nodes
}

/// Wait until `check` holds, waking on gossip events with a polling
/// fallback. Returns the final verdict at the deadline.
pub async fn converge<F: Fn() -> bool>(
    timeout: Duration,
    tester: &Arc<ConvergenceNotifier>,
    check: F,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::select! {
            _ = tester.notify.notified() => {},
            _ = tokio::time::sleep(Duration::from_millis(100)) => {},
        }
    }
    check()
}
