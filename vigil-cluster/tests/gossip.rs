//! Multi-node gossip convergence: client discovery, topic/channel
//! propagation, re-gossip repair, node restart, and ephemeral channel
//! cleanup.

mod common;

use common::{converge, start_cluster, test_config, ConvergenceNotifier};
use std::time::Duration;
use vigil_cluster::VigilNode;

#[tokio::test]
async fn test_gossip_convergence() {
    let tester = ConvergenceNotifier::new();
    let nodes = start_cluster(3, 15_000, &tester).await;

    let ok = converge(Duration::from_secs(5), &tester, || {
        nodes.iter().all(|n| n.registration_db().find_producers("client", "", "").len() == 3)
    })
    .await;
    assert!(ok, "client registrations never converged");

    let mut expected_ports: Vec<u16> =
        nodes.iter().map(|n| n.config().node.tcp_port).collect();
    expected_ports.sort_unstable();

    for node in &nodes {
        let producers = node.registration_db().find_producers("client", "", "");
        let mut ports: Vec<u16> = producers.iter().map(|p| p.tcp_port).collect();
        ports.sort_unstable();
        assert_eq!(ports, expected_ports);
    }

    // create a topic/channel on the first node
    let topic = nodes[0].broker().get_topic("topic1");
    topic.get_channel("ch");
    let first_port = nodes[0].config().node.tcp_port;

    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| {
            n.registration_db().find_producers("topic", "topic1", "").len() == 1
                && n.registration_db().find_producers("channel", "topic1", "ch").len() == 1
        })
    })
    .await;
    assert!(ok, "topic/channel registrations never converged");

    for node in &nodes {
        let producers = node.registration_db().find_producers("topic", "topic1", "");
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].tcp_port, first_port);

        let producers = node.registration_db().find_producers("channel", "topic1", "ch");
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].tcp_port, first_port);
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_regossip_repairs_removed_registrations() {
    let tester = ConvergenceNotifier::new();
    let nodes = start_cluster(3, 15_100, &tester).await;

    let topic = nodes[0].broker().get_topic("topic1");
    topic.get_channel("ch");
    let first_port = nodes[0].config().node.tcp_port;

    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| {
            n.registration_db().find_producers("topic", "topic1", "").len() == 1
                && n.registration_db().find_producers("channel", "topic1", "ch").len() == 1
        })
    })
    .await;
    assert!(ok, "topic/channel registrations never converged");

    // drop both registrations on the last node directly
    let last = nodes.last().unwrap();
    let mut regs = last.registration_db().find_registrations("topic", "topic1", "");
    regs.extend(last.registration_db().find_registrations("channel", "topic1", "ch"));
    assert!(!regs.is_empty());
    for reg in &regs {
        last.registration_db().remove_registration(reg);
    }
    assert!(last.registration_db().find_producers("topic", "topic1", "").is_empty());

    // the first node's re-gossip restores them
    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| {
            n.registration_db().find_producers("topic", "topic1", "").len() == 1
                && n.registration_db().find_producers("channel", "topic1", "ch").len() == 1
        })
    })
    .await;
    assert!(ok, "re-gossip never repaired the registrations");

    for node in &nodes {
        let producers = node.registration_db().find_producers("channel", "topic1", "ch");
        assert_eq!(producers[0].tcp_port, first_port);
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_node_restart_resyncs() {
    let tester = ConvergenceNotifier::new();
    let mut nodes = start_cluster(3, 15_200, &tester).await;

    let topic = nodes[0].broker().get_topic("topic1");
    topic.get_channel("ch");

    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| {
            n.registration_db().find_producers("topic", "topic1", "").len() == 1
                && n.registration_db().find_producers("channel", "topic1", "ch").len() == 1
        })
    })
    .await;
    assert!(ok, "initial convergence failed");

    // stop the last node and wait for the survivors to prune it
    let stopped = nodes.pop().unwrap();
    let stopped_addr = stopped.gossip().local_member().gossip_addr;
    stopped.stop().await;
    // release the node so its gossip socket closes and the address can be
    // rebound
    drop(stopped);

    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| n.gossip().member_count() == 2)
    })
    .await;
    assert!(ok, "survivors never saw the stopped node fail");

    // restart it on the same address and configuration
    let mut config = test_config(2, 15_200);
    config.gossip.address = stopped_addr.to_string();
    config.gossip.seed_addresses = vec![nodes[0].gossip().local_member().gossip_addr.to_string()];
    let restarted = VigilNode::builder(config)
        .gossip_delegate(tester.clone())
        .start()
        .await
        .unwrap();
    nodes.push(restarted);

    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| n.gossip().member_count() == 3)
    })
    .await;
    assert!(ok, "membership never regrew to 3");

    // the restarted node re-learns the registrations from re-gossip
    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| {
            n.registration_db().find_producers("topic", "topic1", "").len() == 1
                && n.registration_db().find_producers("channel", "topic1", "ch").len() == 1
        })
    })
    .await;
    assert!(ok, "restarted node never re-learned the registrations");

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_ephemeral_channel_cleanup_across_nodes() {
    let tester = ConvergenceNotifier::new();
    let nodes = start_cluster(3, 15_300, &tester).await;

    let topic = nodes[0].broker().get_topic("t");
    topic.get_channel("x#ephemeral");

    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| {
            n.registration_db().find_registrations("channel", "t", "*").len() == 1
        })
    })
    .await;
    assert!(ok, "ephemeral channel registration never propagated");

    topic.delete_channel("x#ephemeral");

    // the channel- event drops the last producer, and the ephemeral
    // suffix drops the key itself
    let ok = converge(Duration::from_secs(10), &tester, || {
        nodes.iter().all(|n| n.registration_db().find_registrations("channel", "t", "*").is_empty())
    })
    .await;
    assert!(ok, "ephemeral channel registration was never dropped");

    for node in &nodes {
        node.stop().await;
    }
}
