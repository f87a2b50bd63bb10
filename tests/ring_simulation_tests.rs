//! Ring protocol scenarios
//!
//! Runs real discovery engines on the in-memory ring from `common` and
//! checks membership convergence, ordering and history handling.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use common::Simulation;
use gridring::cluster::{JoinState, RejectReason};
use gridring::config::RingConfig;
use gridring::message::{Envelope, Frame, Payload};
use gridring::network::TransportEvent;
use gridring::types::{MessageId, NodeDescriptor, NodeId};

fn alive_set(sim: &Simulation, index: usize) -> BTreeSet<NodeId> {
    sim.nodes[index].alive_ids().into_iter().collect()
}

fn ids(sim: &Simulation, indices: &[usize]) -> BTreeSet<NodeId> {
    indices.iter().map(|index| sim.id(*index)).collect()
}

#[test]
fn test_single_node_bootstraps_as_coordinator() {
    let sim = Simulation::ring(1);
    let engine = sim.engine(0);

    assert_eq!(engine.join_state(), JoinState::Alive);
    assert!(engine.is_coordinator());
    assert_eq!(engine.topology().version(), 1);
    assert_eq!(engine.snapshot().len(), 1);
    assert!(engine.successor().is_none());
}

#[test]
fn test_three_node_ring_forms() {
    let sim = Simulation::ring(3);
    let expected = ids(&sim, &[0, 1, 2]);

    for (index, node) in sim.nodes.iter().enumerate() {
        assert_eq!(node.engine.join_state(), JoinState::Alive, "node {}", index);
        assert_eq!(alive_set(&sim, index), expected);
        assert_eq!(node.engine.topology().version(), 3);
        assert_eq!(node.engine.coordinator().map(|c| c.id), Some(sim.id(0)));
    }

    let orders: Vec<u64> = sim.engine(0).snapshot().iter().map(|n| n.internal_order).collect();
    assert_eq!(orders, vec![0, 1, 2]);

    // Ring links follow internal order
    assert_eq!(sim.engine(0).successor().map(|n| n.id), Some(sim.id(1)));
    assert_eq!(sim.engine(1).successor().map(|n| n.id), Some(sim.id(2)));
    assert_eq!(sim.engine(2).successor().map(|n| n.id), Some(sim.id(0)));
}

#[test]
fn test_join_through_non_coordinator() {
    let mut sim = Simulation::ring(3);
    let versions: Vec<u64> = sim.nodes.iter().map(|n| n.engine.topology().version()).collect();

    let seed = sim.address(1);
    let n4 = sim.add_node(vec![seed]);
    sim.settle();

    let expected = ids(&sim, &[0, 1, 2, 3]);
    for index in 0..4 {
        assert_eq!(alive_set(&sim, index), expected, "node {}", index);
        assert_eq!(sim.engine(index).coordinator().map(|c| c.id), Some(sim.id(0)));
    }
    // One increment for the admission, carried by NodeAdded
    for (index, before) in versions.iter().enumerate() {
        assert_eq!(sim.engine(index).topology().version(), before + 1);
    }
    assert_eq!(sim.engine(n4).topology().version(), versions[0] + 1);

    let descriptor = sim
        .engine(0)
        .snapshot()
        .into_iter()
        .find(|n| n.id == sim.id(n4))
        .unwrap();
    assert_eq!(descriptor.internal_order, 3);

    assert_eq!(
        sim.nodes[n4].states,
        vec![
            JoinState::Connecting,
            JoinState::Forwarding,
            JoinState::Pending,
            JoinState::Alive
        ]
    );
    for index in 0..3 {
        assert_eq!(sim.nodes[index].joined(sim.id(n4)), 1, "node {}", index);
    }
    // The newcomer learns the existing members, not itself
    assert_eq!(sim.nodes[n4].joined(sim.id(n4)), 0);

    // The coordinator passed the answered request on, marked as responded
    let answered: Vec<&Envelope> = sim.nodes[0]
        .answered
        .iter()
        .filter(|envelope| envelope.payload.subject() == Some(sim.id(n4)))
        .collect();
    assert_eq!(answered.len(), 1);
    assert!(answered[0].message_id.is_direct());
    assert!(answered[0].verified);
    assert_eq!(sim.nodes[n4].joined(sim.id(0)), 1);
}

#[test]
fn test_failed_node_removed_everywhere() {
    let mut sim = Simulation::ring(3);
    let n2 = sim.id(1);

    sim.take_down(1);
    sim.advance(Duration::from_secs(10));

    let expected = ids(&sim, &[0, 2]);
    for index in [0, 2] {
        assert_eq!(alive_set(&sim, index), expected);
        assert_eq!(sim.nodes[index].failed(n2), 1, "node {}", index);
        assert_eq!(sim.engine(index).coordinator().map(|c| c.id), Some(sim.id(0)));
    }
    assert_eq!(sim.engine(0).topology().version(), sim.engine(2).topology().version());
    assert_eq!(sim.engine(0).successor().map(|n| n.id), Some(sim.id(2)));
    assert_eq!(sim.engine(2).successor().map(|n| n.id), Some(sim.id(0)));
}

#[test]
fn test_tombstones_purged_after_discard() {
    let mut sim = Simulation::ring(3);
    let n2 = sim.id(1);

    sim.take_down(1);
    sim.advance(Duration::from_secs(20));

    for index in [0, 2] {
        let topology = sim.engine(index).topology();
        assert_eq!(topology.tombstone_count(), 0, "node {}", index);
        assert!(!topology.contains(n2));
    }
}

#[test]
fn test_purged_node_leaves_no_watermark() {
    let mut sim = Simulation::ring(3);
    let n2 = sim.id(1);
    for index in [0, 2] {
        assert!(sim.engine(index).watermark(n2) > 0);
    }

    sim.take_down(1);
    sim.advance(Duration::from_secs(30));

    for index in [0, 2] {
        let engine = sim.engine(index);
        assert!(!engine.topology().contains(n2));
        assert_eq!(engine.topology().tombstone_count(), 0);
        assert_eq!(engine.watermark(n2), 0, "node {}", index);
    }

    // A newcomer's admission snapshot no longer mentions the purged node
    let seed = sim.address(2);
    let n4 = sim.add_node(vec![seed]);
    sim.settle();
    assert_eq!(sim.engine(n4).join_state(), JoinState::Alive);
    assert_eq!(sim.engine(n4).watermark(n2), 0);
    assert!(sim.engine(n4).watermark(sim.id(0)) > 0);
}

#[test]
fn test_failure_reported_by_both_neighbours_applied_once() {
    let mut sim = Simulation::ring(3);
    let n2 = sim.id(1);
    let versions: Vec<u64> = [0, 2].iter().map(|i| sim.engine(*i).topology().version()).collect();

    // Both neighbours lose their link to N2 before either report arrives
    sim.take_down(1);
    for index in [0, 2] {
        sim.deliver(
            index,
            TransportEvent::LinkFailed {
                node: n2,
                reason: "connection reset".to_string(),
            },
        );
    }
    sim.run_until_quiet();

    for (slot, index) in [0, 2].into_iter().enumerate() {
        let reports = sim.nodes[index].reported.iter().filter(|(_, node)| *node == n2).count();
        assert_eq!(reports, 1, "node {} reports", index);
        assert_eq!(sim.nodes[index].failed(n2), 1, "node {} events", index);
        assert_eq!(sim.engine(index).topology().version(), versions[slot] + 1);
        assert_eq!(alive_set(&sim, index), ids(&sim, &[0, 2]));
    }

    sim.advance(Duration::from_secs(10));
    for index in [0, 2] {
        assert_eq!(sim.nodes[index].failed(n2), 1, "node {}", index);
    }
}

#[test]
fn test_per_creator_order_preserved() {
    let mut sim = Simulation::ring(3);

    for i in 0..5u8 {
        sim.broadcast(0, &[i], false);
        sim.broadcast(2, &[100 + i], false);
    }
    // Several messages in flight at once
    let now = sim.now();
    for i in 5..10u8 {
        sim.engine_mut(0).broadcast(Bytes::from(vec![i]), false, now).unwrap();
        sim.engine_mut(2).broadcast(Bytes::from(vec![100 + i]), false, now).unwrap();
    }
    sim.flush(0);
    sim.flush(2);
    sim.run_until_quiet();

    let from_n1: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    let from_n3: Vec<Vec<u8>> = (0..10u8).map(|i| vec![100 + i]).collect();
    for index in 0..3 {
        assert_eq!(sim.nodes[index].custom_from(sim.id(0)), from_n1, "node {}", index);
        assert_eq!(sim.nodes[index].custom_from(sim.id(2)), from_n3, "node {}", index);
    }
}

#[test]
fn test_history_bounded_by_discard() {
    let mut sim = Simulation::ring(3);

    for round in 0..40u8 {
        sim.broadcast((round % 3) as usize, &[round], false);
        sim.broadcast(0, &[round], true);
        sim.advance(Duration::from_millis(200));
    }
    sim.advance(Duration::from_secs(10));

    for index in 0..3 {
        let engine = sim.engine(index);
        assert!(engine.history_len() < 40, "node {} holds {}", index, engine.history_len());
        assert!(engine.ensure_log_len() < 40);
    }
}

#[test]
fn test_duplicate_delivery_suppressed() {
    let mut sim = Simulation::ring(3);
    let creator = sim.id(0);
    let id = sim.broadcast(0, b"once", false);
    let history = sim.engine(1).history_len();

    let envelope = Envelope::new(
        id,
        creator,
        Payload::Custom {
            user_payload: Bytes::from_static(b"once"),
        },
    );
    sim.inject(1, creator, Frame::Envelope(envelope.clone()));
    sim.inject(2, creator, Frame::Envelope(envelope));

    for index in 0..3 {
        assert_eq!(sim.nodes[index].custom_from(creator).len(), 1, "node {}", index);
    }
    assert_eq!(sim.engine(1).history_len(), history);
}

#[test]
fn test_single_node_receives_own_broadcast_once() {
    let mut sim = Simulation::ring(1);
    let creator = sim.id(0);

    sim.broadcast(0, b"solo", false);
    sim.broadcast(0, b"solo-2", false);

    assert_eq!(
        sim.nodes[0].custom_from(creator),
        vec![b"solo".to_vec(), b"solo-2".to_vec()]
    );
}

#[test]
fn test_coordinator_failure_hands_over() {
    let mut sim = Simulation::ring(3);

    sim.take_down(0);
    sim.advance(Duration::from_secs(10));

    for index in [1, 2] {
        assert_eq!(sim.engine(index).coordinator().map(|c| c.id), Some(sim.id(1)));
        assert_eq!(alive_set(&sim, index), ids(&sim, &[1, 2]));
    }
    assert!(sim.engine(1).is_coordinator());

    // The new coordinator admits
    let seed = sim.address(2);
    let n4 = sim.add_node(vec![seed]);
    sim.settle();

    assert_eq!(sim.engine(n4).join_state(), JoinState::Alive);
    for index in [1, 2, n4] {
        assert_eq!(alive_set(&sim, index), ids(&sim, &[1, 2, n4]));
    }
    let order = sim
        .engine(1)
        .topology()
        .get(sim.id(n4))
        .map(|n| n.internal_order);
    assert_eq!(order, Some(3));
}

#[test]
fn test_handover_finishes_join_in_flight() {
    let mut sim = Simulation::ring(3);
    let address = sim.next_address();
    let template = sim.template.clone();
    let seed = sim.address(0);
    let n4 = sim.spawn_node(NodeId::new(), address, vec![seed], template);

    // Coordinator crashes right after the newcomer received NodeAdded
    let reached = sim.run_until(|s| s.engine(n4).join_state() == JoinState::Pending);
    assert!(reached);
    sim.take_down(0);
    sim.advance(Duration::from_secs(10));

    assert_eq!(sim.engine(n4).join_state(), JoinState::Alive);
    let expected = ids(&sim, &[1, 2, n4]);
    for index in [1, 2, n4] {
        assert_eq!(alive_set(&sim, index), expected, "node {}", index);
        assert!(!sim.engine(index).topology().is_pending(sim.id(n4)));
    }
    for index in [1, 2] {
        assert_eq!(sim.nodes[index].joined(sim.id(n4)), 1, "node {}", index);
    }
}

#[test]
fn test_answered_join_request_ignored_after_handover() {
    let mut sim = Simulation::ring(3);
    sim.take_down(0);
    sim.advance(Duration::from_secs(10));
    assert!(sim.engine(1).is_coordinator());
    let version = sim.engine(1).topology().version();

    // The old coordinator answered this candidate; its NodeAdded died with it
    let address = sim.next_address();
    let candidate = NodeDescriptor::new(NodeId::new(), address);
    let mut request = Envelope::new(
        MessageId::direct(candidate.id, 1),
        candidate.id,
        Payload::JoinRequest {
            candidate: candidate.clone(),
            responded: true,
        },
    );
    request.verified = true;
    sim.inject(1, sim.id(2), Frame::Envelope(request));
    sim.settle();

    for index in [1, 2] {
        assert!(!sim.engine(index).topology().contains(candidate.id), "node {}", index);
        assert_eq!(sim.engine(index).topology().version(), version);
        assert_eq!(sim.nodes[index].joined(candidate.id), 0);
    }
}

#[test]
fn test_ensure_delivery_reinjected_after_creator_crash() {
    let mut config = RingConfig::default();
    config.discovery.ensure_delivery_timeout = Duration::from_millis(500);
    config.discovery.discard_interval = Duration::from_secs(600);
    config.discovery.discard_batch = 100_000;
    let mut sim = Simulation::with_config(config);
    sim.grow(3);
    let n1 = sim.id(0);

    // The coordinator crashes before its message completes the revolution
    let now = sim.now();
    let id = sim
        .engine_mut(0)
        .broadcast(Bytes::from_static(b"keep"), true, now)
        .unwrap();
    sim.flush(0);
    assert!(sim.run_until(|s| s.nodes[1].custom_from(n1).len() == 1));
    sim.take_down(0);
    sim.advance(Duration::from_secs(5));

    assert!(sim.engine(1).is_coordinator());
    assert!(sim.nodes[1].reinjected.contains(&id));
    assert!(!sim.nodes[2].reinjected.contains(&id));
    for index in [1, 2] {
        assert_eq!(sim.nodes[index].custom_from(n1), vec![b"keep".to_vec()], "node {}", index);
    }
    // The re-injected copy went around once and stopped at its re-injector
    sim.advance(Duration::from_secs(2));
    assert_eq!(sim.nodes[1].reinjected.iter().filter(|m| **m == id).count(), 1);
    assert_eq!(sim.nodes[2].custom_from(n1).len(), 1);
}

#[test]
fn test_graceful_leave() {
    let mut sim = Simulation::ring(3);
    let n3 = sim.id(2);

    sim.leave(2);

    assert!(sim.nodes[2].leave_completed);
    assert_eq!(sim.engine(2).join_state(), JoinState::Left);
    for index in [0, 1] {
        assert_eq!(sim.nodes[index].left(n3), 1, "node {}", index);
        assert_eq!(sim.nodes[index].failed(n3), 0);
        assert_eq!(alive_set(&sim, index), ids(&sim, &[0, 1]));
    }
    assert_eq!(sim.engine(1).successor().map(|n| n.id), Some(sim.id(0)));

    // Nobody later reports the departed node as failed
    sim.advance(Duration::from_secs(10));
    for index in [0, 1] {
        assert_eq!(sim.nodes[index].failed(n3), 0);
    }
}

#[test]
fn test_unreachable_seed_bootstraps() {
    let mut sim = Simulation::new();
    let nowhere = "127.0.0.1:9".parse().unwrap();
    let index = sim.add_node(vec![nowhere]);

    assert_eq!(sim.engine(index).join_state(), JoinState::Alive);
    assert!(sim.engine(index).is_coordinator());
}

#[test]
fn test_gives_up_without_bootstrap() {
    let mut config = RingConfig::default();
    config.node.allow_bootstrap = false;
    config.discovery.max_join_attempts = Some(2);
    let mut sim = Simulation::with_config(config.clone());

    let nowhere = "127.0.0.1:9".parse().unwrap();
    let address = sim.next_address();
    let index = sim.add_node_with(NodeId::new(), address, vec![nowhere], config);
    assert_eq!(sim.engine(index).join_state(), JoinState::Connecting);

    sim.advance(Duration::from_secs(25));
    assert_eq!(sim.engine(index).join_state(), JoinState::GaveUp { attempts: 2 });
}

#[test]
fn test_duplicate_id_rejected() {
    let mut sim = Simulation::ring(3);
    let taken = sim.id(1);
    let address = sim.next_address();
    let template = sim.template.clone();
    let seed = sim.address(2);

    let impostor = sim.add_node_with(taken, address, vec![seed], template);
    sim.settle();

    assert_eq!(
        sim.engine(impostor).join_state(),
        JoinState::Rejected(RejectReason::DuplicateId)
    );
    for index in 0..3 {
        assert_eq!(sim.engine(index).snapshot().len(), 3);
        let member = sim.engine(index).topology().get(taken).map(|n| n.address);
        assert_eq!(member, Some(sim.address(1)));
    }
}

#[test]
fn test_gap_resolved_after_resync_timeout() {
    let mut sim = Simulation::ring(3);
    let stranger = NodeId::new();
    let envelope = Envelope::new(
        MessageId::new(stranger, 3),
        stranger,
        Payload::Custom {
            user_payload: Bytes::from_static(b"late"),
        },
    );

    sim.inject(1, sim.id(0), Frame::Envelope(envelope));
    assert_eq!(sim.nodes[1].custom_from(stranger).len(), 0);
    assert!(sim.engine(1).parked_len() >= 1);

    sim.advance(Duration::from_secs(5));

    assert_eq!(sim.nodes[1].custom_from(stranger), vec![b"late".to_vec()]);
    for index in 0..3 {
        assert_eq!(sim.engine(index).parked_len(), 0, "node {}", index);
        assert_eq!(alive_set(&sim, index), ids(&sim, &[0, 1, 2]));
    }
}
