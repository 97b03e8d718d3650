//! External collaborator seams
//!
//! The routing core consumes time, positions, cluster membership and
//! outgoing buffers through these traits and hands messages to a
//! [`Transport`] once a link is chosen. The [`in_memory`] module provides
//! plain implementations used by tests and the simulator.

use crate::link::Link;
use crate::types::{Message, MessageId, NodeAddress, PlaneId, SimTime, Tier};
use nalgebra::Point3;
use std::collections::BTreeSet;

/// Simulated clock
pub trait Clock: Sync {
    fn now(&self) -> SimTime;
}

/// Node positions at the current simulated time (km)
pub trait Positions: Sync {
    fn position(&self, node: NodeAddress) -> Option<Point3<f64>>;

    fn distance(&self, a: NodeAddress, b: NodeAddress) -> Option<f64> {
        let pa = self.position(a)?;
        let pb = self.position(b)?;
        Some(nalgebra::distance(&pa, &pb))
    }
}

/// Tier, plane and cluster-membership queries
pub trait ClusterDirectory: Sync {
    fn tier(&self, node: NodeAddress) -> Option<Tier>;

    fn plane(&self, node: NodeAddress) -> Option<PlaneId>;

    /// Upper-tier nodes managing `node` (zero or one for a well-formed map)
    fn managers(&self, node: NodeAddress) -> BTreeSet<NodeAddress>;

    /// Nodes managed by `node`
    fn managed(&self, node: NodeAddress) -> BTreeSet<NodeAddress>;

    /// Adjacent nodes in the same orbital ring (at most two)
    fn plane_neighbors(&self, node: NodeAddress) -> BTreeSet<NodeAddress>;

    /// Same-tier peers in adjacent planes that `node` may link to
    fn cross_plane_neighbors(&self, node: NodeAddress) -> BTreeSet<NodeAddress>;

    /// All nodes of a tier, ascending
    fn members(&self, tier: Tier) -> Vec<NodeAddress>;

    fn plane_count(&self, tier: Tier) -> PlaneId;

    fn plane_members(&self, tier: Tier, plane: PlaneId) -> Vec<NodeAddress> {
        self.members(tier)
            .into_iter()
            .filter(|&n| self.plane(n) == Some(plane))
            .collect()
    }

    /// Planes are adjacent when they sit next to each other in the ring of planes
    fn planes_adjacent(&self, tier: Tier, a: PlaneId, b: PlaneId) -> bool {
        let count = self.plane_count(tier);
        if count < 2 || a == b {
            return false;
        }
        (a + 1) % count == b || (b + 1) % count == a
    }
}

/// Outgoing message buffers, owned outside the routing core
pub trait MessageBuffer {
    /// Queued message ids for `node`, in service order
    fn outgoing(&self, node: NodeAddress) -> Vec<MessageId>;

    fn message_mut(&mut self, node: NodeAddress, id: &MessageId) -> Option<&mut Message>;

    /// Remove a message so it can ride a link
    fn take(&mut self, node: NodeAddress, id: &MessageId) -> Option<Message>;

    /// Put a message back at the front of the queue
    fn requeue(&mut self, node: NodeAddress, message: Message);
}

/// Receiver verdict when a transfer is offered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStart {
    Ok,
    /// Try again on a later tick
    Defer,
    /// Receiver refuses this message
    Reject,
}

/// Byte-transfer mechanism
pub trait Transport {
    fn start_transfer(&mut self, message: &Message, link: &Link) -> TransferStart;
}

/// Read-only collaborators needed for one routing pass
#[derive(Clone, Copy)]
pub struct Environment<'a> {
    pub clock: &'a dyn Clock,
    pub positions: &'a dyn Positions,
    pub directory: &'a dyn ClusterDirectory,
}

impl<'a> Environment<'a> {
    pub fn new(
        clock: &'a dyn Clock,
        positions: &'a dyn Positions,
        directory: &'a dyn ClusterDirectory,
    ) -> Self {
        Self {
            clock,
            positions,
            directory,
        }
    }

    pub fn now(&self) -> SimTime {
        self.clock.now()
    }
}

pub mod in_memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap, VecDeque};

    /// Clock set explicitly by the tick driver
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FixedClock {
        now: SimTime,
    }

    impl FixedClock {
        pub fn new(now: SimTime) -> Self {
            Self { now }
        }

        pub fn set(&mut self, now: SimTime) {
            self.now = now;
        }

        pub fn advance(&mut self, dt: SimTime) {
            self.now += dt;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> SimTime {
            self.now
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct PositionTable {
        positions: HashMap<NodeAddress, Point3<f64>>,
    }

    impl PositionTable {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&mut self, node: NodeAddress, position: Point3<f64>) {
            self.positions.insert(node, position);
        }

        pub fn with(mut self, node: NodeAddress, x: f64, y: f64, z: f64) -> Self {
            self.set(node, Point3::new(x, y, z));
            self
        }
    }

    impl Positions for PositionTable {
        fn position(&self, node: NodeAddress) -> Option<Point3<f64>> {
            self.positions.get(&node).copied()
        }
    }

    /// Membership map with at most one manager per node
    #[derive(Debug, Clone, Default)]
    pub struct ClusterMap {
        nodes: BTreeMap<NodeAddress, (Tier, PlaneId)>,
        plane_counts: BTreeMap<Tier, PlaneId>,
        manager_of: BTreeMap<NodeAddress, NodeAddress>,
        plane_links: BTreeMap<NodeAddress, BTreeSet<NodeAddress>>,
        cross_links: BTreeMap<NodeAddress, BTreeSet<NodeAddress>>,
    }

    impl ClusterMap {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_node(&mut self, node: NodeAddress, tier: Tier, plane: PlaneId) -> &mut Self {
            self.nodes.insert(node, (tier, plane));
            let count = self.plane_counts.entry(tier).or_insert(0);
            *count = (*count).max(plane + 1);
            self
        }

        pub fn link_plane(&mut self, a: NodeAddress, b: NodeAddress) -> &mut Self {
            if a != b {
                self.plane_links.entry(a).or_default().insert(b);
                self.plane_links.entry(b).or_default().insert(a);
            }
            self
        }

        pub fn link_cross(&mut self, a: NodeAddress, b: NodeAddress) -> &mut Self {
            if a != b {
                self.cross_links.entry(a).or_default().insert(b);
                self.cross_links.entry(b).or_default().insert(a);
            }
            self
        }

        /// Link consecutive nodes, closing the loop when there are more than two
        pub fn ring(&mut self, members: &[NodeAddress]) -> &mut Self {
            self.chain(members);
            if members.len() > 2 {
                self.link_plane(members[members.len() - 1], members[0]);
            }
            self
        }

        pub fn chain(&mut self, members: &[NodeAddress]) -> &mut Self {
            for pair in members.windows(2) {
                self.link_plane(pair[0], pair[1]);
            }
            self
        }

        /// Assign `member` to `manager`, returning the previous manager
        pub fn assign_manager(
            &mut self,
            member: NodeAddress,
            manager: NodeAddress,
        ) -> Option<NodeAddress> {
            self.manager_of.insert(member, manager)
        }

        pub fn clear_manager(&mut self, member: NodeAddress) -> Option<NodeAddress> {
            self.manager_of.remove(&member)
        }

        pub fn clear_all_managers(&mut self) {
            self.manager_of.clear();
        }

        pub fn manager_of(&self, member: NodeAddress) -> Option<NodeAddress> {
            self.manager_of.get(&member).copied()
        }
    }

    impl ClusterDirectory for ClusterMap {
        fn tier(&self, node: NodeAddress) -> Option<Tier> {
            self.nodes.get(&node).map(|(t, _)| *t)
        }

        fn plane(&self, node: NodeAddress) -> Option<PlaneId> {
            self.nodes.get(&node).map(|(_, p)| *p)
        }

        fn managers(&self, node: NodeAddress) -> BTreeSet<NodeAddress> {
            self.manager_of.get(&node).copied().into_iter().collect()
        }

        fn managed(&self, node: NodeAddress) -> BTreeSet<NodeAddress> {
            self.manager_of
                .iter()
                .filter(|(_, &m)| m == node)
                .map(|(&member, _)| member)
                .collect()
        }

        fn plane_neighbors(&self, node: NodeAddress) -> BTreeSet<NodeAddress> {
            self.plane_links.get(&node).cloned().unwrap_or_default()
        }

        fn cross_plane_neighbors(&self, node: NodeAddress) -> BTreeSet<NodeAddress> {
            self.cross_links.get(&node).cloned().unwrap_or_default()
        }

        fn members(&self, tier: Tier) -> Vec<NodeAddress> {
            self.nodes
                .iter()
                .filter(|(_, (t, _))| *t == tier)
                .map(|(&n, _)| n)
                .collect()
        }

        fn plane_count(&self, tier: Tier) -> PlaneId {
            self.plane_counts.get(&tier).copied().unwrap_or(0)
        }
    }

    /// FIFO outgoing queues per node
    #[derive(Debug, Clone, Default)]
    pub struct OutgoingQueues {
        queues: BTreeMap<NodeAddress, VecDeque<Message>>,
    }

    impl OutgoingQueues {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, node: NodeAddress, message: Message) {
            self.queues.entry(node).or_default().push_back(message);
        }

        pub fn len(&self, node: NodeAddress) -> usize {
            self.queues.get(&node).map_or(0, |q| q.len())
        }

        pub fn total(&self) -> usize {
            self.queues.values().map(|q| q.len()).sum()
        }

        pub fn contains(&self, node: NodeAddress, id: &MessageId) -> bool {
            self.queues
                .get(&node)
                .is_some_and(|q| q.iter().any(|m| &m.id == id))
        }

        pub fn messages(&self, node: NodeAddress) -> impl Iterator<Item = &Message> {
            self.queues.get(&node).into_iter().flat_map(|q| q.iter())
        }

        /// Remove and return every message matching `expired`
        pub fn drain_where(&mut self, mut expired: impl FnMut(&Message) -> bool) -> Vec<Message> {
            let mut removed = Vec::new();
            for queue in self.queues.values_mut() {
                let mut kept = VecDeque::with_capacity(queue.len());
                for msg in queue.drain(..) {
                    if expired(&msg) {
                        removed.push(msg);
                    } else {
                        kept.push_back(msg);
                    }
                }
                *queue = kept;
            }
            removed
        }
    }

    impl MessageBuffer for OutgoingQueues {
        fn outgoing(&self, node: NodeAddress) -> Vec<MessageId> {
            self.messages(node).map(|m| m.id.clone()).collect()
        }

        fn message_mut(&mut self, node: NodeAddress, id: &MessageId) -> Option<&mut Message> {
            self.queues.get_mut(&node)?.iter_mut().find(|m| &m.id == id)
        }

        fn take(&mut self, node: NodeAddress, id: &MessageId) -> Option<Message> {
            let queue = self.queues.get_mut(&node)?;
            let pos = queue.iter().position(|m| &m.id == id)?;
            queue.remove(pos)
        }

        fn requeue(&mut self, node: NodeAddress, message: Message) {
            self.queues.entry(node).or_default().push_front(message);
        }
    }

    /// Transport that accepts every offered transfer
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AcceptAll;

    impl Transport for AcceptAll {
        fn start_transfer(&mut self, _message: &Message, _link: &Link) -> TransferStart {
            TransferStart::Ok
        }
    }
}
