//! End-to-end routing scenarios driven through the public API

use constellation_routing::collaborators::in_memory::{
    AcceptAll, ClusterMap, FixedClock, OutgoingQueues, PositionTable,
};
use constellation_routing::{
    ConnectivityMode, Environment, InterfaceId, LinkManager, Medium, Message, MessageId,
    NodeAddress, RoutingConfig, RoutingEngine, ScopeKey, Tier,
};
use std::sync::Arc;

fn n(x: u32) -> NodeAddress {
    NodeAddress(x)
}

fn create_test_config(mode: ConnectivityMode) -> RoutingConfig {
    RoutingConfig::default()
        .with_mode(mode)
        .with_uniform_interfaces(Medium::Radio, 100.0, 1_000)
}

fn create_test_engine(mode: ConnectivityMode, nodes: &[(NodeAddress, Tier)]) -> RoutingEngine {
    let mut engine = RoutingEngine::new(create_test_config(mode)).unwrap();
    for &(node, tier) in nodes {
        engine.add_node(node, tier);
    }
    engine
}

fn line(nodes: &[NodeAddress], spacing: f64) -> PositionTable {
    nodes
        .iter()
        .enumerate()
        .fold(PositionTable::new(), |table, (i, &node)| {
            table.with(node, i as f64 * spacing, 0.0, 0.0)
        })
}

fn low_plane(nodes: &[NodeAddress], plane: u16) -> ClusterMap {
    let mut map = ClusterMap::new();
    for &node in nodes {
        map.add_node(node, Tier::Low, plane);
    }
    map
}

#[test]
fn test_in_range_peers_link_at_min_speed() {
    let config = Arc::new(create_test_config(ConnectivityMode::AllConnected));
    let mut links = LinkManager::new(config);
    links.register_node(n(1), Tier::Low);
    links.register_node(n(2), Tier::Low);
    links
        .set_speed(InterfaceId::new(n(2), Medium::Radio), 400)
        .unwrap();

    let clock = FixedClock::new(0.0);
    let positions = line(&[n(1), n(2)], 50.0);
    let dir = low_plane(&[n(1), n(2)], 0);
    let env = Environment::new(&clock, &positions, &dir);

    let outcome = links.try_connect(
        InterfaceId::new(n(1), Medium::Radio),
        InterfaceId::new(n(2), Medium::Radio),
        &env,
    );
    assert!(outcome.is_connected());
    let link = links.link(outcome.link().unwrap()).unwrap();
    assert_eq!(link.speed, 400);
}

#[test]
fn test_drift_out_of_range_returns_in_flight_message() {
    let nodes = [n(1), n(2)];
    let mut engine = create_test_engine(
        ConnectivityMode::AllConnected,
        &[(n(1), Tier::Low), (n(2), Tier::Low)],
    );
    let dir = low_plane(&nodes, 0);
    let mut clock = FixedClock::new(0.0);
    let mut buffer = OutgoingQueues::new();
    buffer.push(n(1), Message::new("m1", n(1), n(2), 100_000, 0.0));

    let near = line(&nodes, 50.0);
    let env = Environment::new(&clock, &near, &dir);
    let report = engine.step(1, &env, &mut buffer, &mut AcceptAll).unwrap();
    assert_eq!(report.forwarded, 1);
    assert_eq!(buffer.len(n(1)), 0);

    clock.set(10.0);
    let far = line(&nodes, 150.0);
    let env = Environment::new(&clock, &far, &dir);
    let report = engine.step(2, &env, &mut buffer, &mut AcceptAll).unwrap();
    assert_eq!(report.links_torn, 1);
    assert_eq!(report.returned, vec![MessageId::from("m1")]);
    assert!(buffer.contains(n(1), &MessageId::from("m1")));
    assert_eq!(engine.links().link_count(), 0);
    assert!(engine.complete_transfers(1_000.0).is_empty());
}

#[test]
fn test_only_neighbor_busy_defers_without_error() {
    // S(1) - N(2) - X(3); S only reaches N
    let nodes = [n(1), n(2), n(3)];
    let mut engine = create_test_engine(
        ConnectivityMode::AllConnected,
        &[(n(1), Tier::Low), (n(2), Tier::Low), (n(3), Tier::Low)],
    );
    let clock = FixedClock::new(0.0);
    let positions = line(&nodes, 60.0);
    let dir = low_plane(&nodes, 0);
    let env = Environment::new(&clock, &positions, &dir);
    let mut buffer = OutgoingQueues::new();
    buffer.push(n(2), Message::new("other", n(2), n(3), 5_000, 0.0));
    buffer.push(n(1), Message::new("m1", n(1), n(2), 1_000, 0.0));

    engine.update(n(2), 1, &env, &mut buffer, &mut AcceptAll).unwrap();
    assert!(engine.links().node_is_transferring(n(2)));

    let report = engine.update(n(1), 1, &env, &mut buffer, &mut AcceptAll).unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.forwarded, 0);
    assert!(buffer.contains(n(1), &MessageId::from("m1")));
    let queued = buffer.messages(n(1)).next().unwrap();
    assert_eq!(queued.busy_until(n(2)), Some(5.0));
}

#[test]
fn test_ring_chain_path_and_arrival() {
    let nodes = [n(1), n(2), n(3)];
    let mut engine = create_test_engine(
        ConnectivityMode::Cluster,
        &[(n(1), Tier::Low), (n(2), Tier::Low), (n(3), Tier::Low)],
    );
    let mut dir = low_plane(&nodes, 0);
    dir.chain(&nodes);
    let clock = FixedClock::new(20.0);
    let positions = line(&nodes, 60.0);
    let env = Environment::new(&clock, &positions, &dir);
    let mut buffer = OutgoingQueues::new();
    engine.step(1, &env, &mut buffer, &mut AcceptAll).unwrap();
    assert_eq!(engine.links().link_count(), 2);

    let size = 2_000;
    let table = engine.table_for(n(1), ScopeKey::Ring { tier: Tier::Low, plane: 0 }, size, &env);
    let path: Vec<_> = table.path(n(3)).unwrap().addresses().collect();
    assert_eq!(path, vec![n(2), n(3)]);
    assert_eq!(table.arrival(n(3)), Some(20.0 + 2.0 * (size as f64 / 1_000.0)));

    let message = Message::new("m1", n(1), n(3), size, 20.0);
    assert_eq!(engine.next_hop(n(1), &message, &env), Some(n(2)));
}

#[test]
fn test_unmanaged_destination_stays_queued() {
    let mut engine = create_test_engine(
        ConnectivityMode::Cluster,
        &[(n(1), Tier::Low), (n(2), Tier::Low), (n(10), Tier::Medium)],
    );
    let mut dir = ClusterMap::new();
    dir.add_node(n(1), Tier::Low, 0)
        .add_node(n(2), Tier::Low, 1)
        .add_node(n(10), Tier::Medium, 0);
    dir.assign_manager(n(1), n(10));
    let positions = PositionTable::new()
        .with(n(1), 0.0, 0.0, 0.0)
        .with(n(10), 0.0, 50.0, 0.0)
        .with(n(2), 5_000.0, 0.0, 0.0);
    let mut clock = FixedClock::new(0.0);
    let mut buffer = OutgoingQueues::new();
    buffer.push(n(1), Message::new("m1", n(1), n(2), 1_000, 0.0));

    for tick in 1..=3 {
        clock.set(tick as f64);
        let env = Environment::new(&clock, &positions, &dir);
        let report = engine.step(tick, &env, &mut buffer, &mut AcceptAll).unwrap();
        assert_eq!(report.unroutable, 1);
        assert!(buffer.contains(n(1), &MessageId::from("m1")));
    }
    let env = Environment::new(&clock, &positions, &dir);
    let message = buffer.messages(n(1)).next().unwrap().clone();
    assert_eq!(engine.next_hop(n(1), &message, &env), None);
    assert!(engine.links().link_between(n(1), n(10), None).is_some());
}

#[test]
fn test_embedded_path_matches_recomputation_at_each_hop() {
    let nodes = [n(1), n(2), n(3), n(4)];
    let mut engine = create_test_engine(
        ConnectivityMode::AllConnected,
        &nodes.map(|node| (node, Tier::Low)),
    );
    let dir = low_plane(&nodes, 0);
    let positions = line(&nodes, 60.0);
    let mut clock = FixedClock::new(0.0);
    let mut buffer = OutgoingQueues::new();
    buffer.push(n(1), Message::new("m1", n(1), n(4), 1_000, 0.0));

    let mut hops_taken = Vec::new();
    let mut delivered = None;
    for tick in 1..=10 {
        clock.set(tick as f64);
        let env = Environment::new(&clock, &positions, &dir);
        for delivery in engine.complete_transfers(env.now()) {
            hops_taken.push(delivery.to);
            if delivery.to == delivery.message.destination {
                delivered = Some(delivery.message);
            } else {
                buffer.push(delivery.to, delivery.message);
            }
        }
        if delivered.is_some() {
            break;
        }

        let queued: Vec<(NodeAddress, Message)> = nodes
            .iter()
            .flat_map(|&node| buffer.messages(node).map(move |m| (node, m.clone())))
            .collect();
        for (node, message) in queued {
            if let Some(hop) = message.embedded_next_hop(node) {
                let mut fresh = message.clone();
                fresh.clear_path();
                assert_eq!(engine.next_hop(node, &fresh, &env), Some(hop.address));
            }
        }
        engine.step(tick, &env, &mut buffer, &mut AcceptAll).unwrap();
    }

    assert!(delivered.is_some());
    assert_eq!(hops_taken, vec![n(2), n(3), n(4)]);
}
