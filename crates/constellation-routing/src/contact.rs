//! Contact schedule
//!
//! Per-node, time-ordered record of realized and predicted contact
//! intervals. Realized records open when a link comes up and close when it
//! goes down; predicted windows are added ahead of time by the caller.
//! [`ContactGraph`] turns the schedule into a time-indexed adjacency for
//! the earliest-arrival search.

use crate::collaborators::MessageBuffer;
use crate::config::RoutingConfig;
use crate::link::{Link, LinkManager};
use crate::search::{Adjacency, Edge};
use crate::types::{NodeAddress, SimTime};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// One contact interval as seen from the owning node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub peer: NodeAddress,
    pub start: SimTime,
    /// `None` while the contact is still open
    pub end: Option<SimTime>,
    /// Link speed during the contact (bytes/s)
    pub speed: u64,
    pub predicted: bool,
}

impl ContactRecord {
    pub fn is_up_at(&self, t: SimTime) -> bool {
        self.start <= t && self.end.map_or(true, |end| t < end)
    }
}

pub struct ContactSchedule {
    config: Arc<RoutingConfig>,
    records: BTreeMap<NodeAddress, Vec<ContactRecord>>,
}

impl ContactSchedule {
    pub fn new(config: Arc<RoutingConfig>) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
        }
    }

    pub fn records(&self, node: NodeAddress) -> &[ContactRecord] {
        self.records.get(&node).map_or(&[], |r| r.as_slice())
    }

    pub fn node_count(&self) -> usize {
        self.records.len()
    }

    /// Open a realized contact on both endpoints
    pub fn record_up(&mut self, a: NodeAddress, b: NodeAddress, at: SimTime, speed: u64) {
        for (me, peer) in [(a, b), (b, a)] {
            let list = self.records.entry(me).or_default();
            let already_open = list
                .iter()
                .any(|r| r.peer == peer && !r.predicted && r.end.is_none());
            if !already_open {
                insert_ordered(
                    list,
                    ContactRecord {
                        peer,
                        start: at,
                        end: None,
                        speed,
                        predicted: false,
                    },
                );
            }
        }
    }

    /// Close the open realized contact on both endpoints
    pub fn record_down(&mut self, a: NodeAddress, b: NodeAddress, at: SimTime) {
        for (me, peer) in [(a, b), (b, a)] {
            if let Some(record) = self.records.get_mut(&me).and_then(|list| {
                list.iter_mut()
                    .rev()
                    .find(|r| r.peer == peer && !r.predicted && r.end.is_none())
            }) {
                record.end = Some(at.max(record.start));
            }
        }
    }

    /// Register a known future contact window
    pub fn add_predicted(
        &mut self,
        a: NodeAddress,
        b: NodeAddress,
        start: SimTime,
        end: SimTime,
        speed: u64,
    ) {
        for (me, peer) in [(a, b), (b, a)] {
            insert_ordered(
                self.records.entry(me).or_default(),
                ContactRecord {
                    peer,
                    start,
                    end: Some(end),
                    speed,
                    predicted: true,
                },
            );
        }
    }

    /// Disconnect time for an open link carrying `size` bytes
    pub fn predicted_disconnect(&self, now: SimTime, size: u64, speed: u64) -> SimTime {
        self.config.hold_until(now, size, speed)
    }

    /// Peers reachable from `node` at simulated time `t`
    pub fn contacts_at(&self, node: NodeAddress, t: SimTime) -> BTreeSet<NodeAddress> {
        self.records(node)
            .iter()
            .take_while(|r| r.start <= t)
            .filter(|r| r.is_up_at(t))
            .map(|r| r.peer)
            .collect()
    }

    /// Start of the latest contact recorded for `node`
    pub fn last_start(&self, node: NodeAddress) -> Option<SimTime> {
        self.records(node).last().map(|r| r.start)
    }

    /// Earliest time at or after `after` when `node` can reach `peer`,
    /// with the contact's speed
    pub fn next_contact(
        &self,
        node: NodeAddress,
        peer: NodeAddress,
        after: SimTime,
    ) -> Option<(SimTime, u64)> {
        self.records(node)
            .iter()
            .filter(|r| r.peer == peer && r.end.map_or(true, |end| end > after))
            .map(|r| (r.start.max(after), r.speed))
            .min_by(|x, y| x.0.total_cmp(&y.0))
    }

    /// Tear down idle links at `node` whose hold has elapsed
    pub fn connection_check(
        &mut self,
        node: NodeAddress,
        now: SimTime,
        links: &mut LinkManager,
        buffer: &mut dyn MessageBuffer,
    ) -> Result<Vec<Link>> {
        let mut released = Vec::new();
        for id in links.expired_idle(node, now) {
            let link = links.disconnect(id, buffer)?;
            let (a, b) = link.endpoints();
            self.record_down(a, b, now);
            debug!(link = %id, node = %node, "hold elapsed, link released");
            released.push(link);
        }
        Ok(released)
    }
}

fn insert_ordered(list: &mut Vec<ContactRecord>, record: ContactRecord) {
    let at = list.partition_point(|r| r.start <= record.start);
    list.insert(at, record);
}

/// Schedule swept forward in fixed steps up to a horizon
pub struct ContactGraph<'a> {
    schedule: &'a ContactSchedule,
    step: SimTime,
    horizon: SimTime,
}

impl<'a> ContactGraph<'a> {
    pub fn new(schedule: &'a ContactSchedule, step: SimTime, horizon: SimTime) -> Self {
        Self {
            schedule,
            step,
            horizon,
        }
    }
}

impl Adjacency for ContactGraph<'_> {
    fn edges(&self, from: NodeAddress, at: SimTime) -> Vec<Edge> {
        let Some(last_start) = self.schedule.last_start(from) else {
            return Vec::new();
        };
        // past the last recorded start the peer set can only shrink
        let end = self.horizon.min(at.max(last_start) + self.step);
        let mut seen = BTreeSet::new();
        let mut edges = Vec::new();
        let mut t = at;
        while t <= end {
            for peer in self.schedule.contacts_at(from, t) {
                if !seen.insert(peer) {
                    continue;
                }
                if let Some((start, speed)) = self.schedule.next_contact(from, peer, at) {
                    edges.push(Edge {
                        to: peer,
                        speed,
                        depart_at: Some(start),
                    });
                }
            }
            t += self.step;
        }
        edges
    }

    fn node_count(&self) -> usize {
        self.schedule.node_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::in_memory::{ClusterMap, FixedClock, OutgoingQueues, PositionTable};
    use crate::collaborators::Environment;
    use crate::config::ConnectivityMode;
    use crate::link::InterfaceId;
    use crate::types::{Medium, Tier};

    const A: NodeAddress = NodeAddress(1);
    const B: NodeAddress = NodeAddress(2);
    const C: NodeAddress = NodeAddress(3);

    fn create_test_schedule() -> ContactSchedule {
        ContactSchedule::new(Arc::new(RoutingConfig::default()))
    }

    #[test]
    fn test_realized_contact_lifecycle() {
        let mut schedule = create_test_schedule();
        schedule.record_up(A, B, 10.0, 100);
        schedule.record_up(A, B, 12.0, 100);
        assert_eq!(schedule.records(A).len(), 1);
        assert!(schedule.contacts_at(A, 50.0).contains(&B));

        schedule.record_down(B, A, 60.0);
        assert_eq!(schedule.records(A)[0].end, Some(60.0));
        assert_eq!(schedule.records(B)[0].end, Some(60.0));
        assert!(schedule.contacts_at(A, 60.0).is_empty());
        assert!(schedule.contacts_at(A, 5.0).is_empty());
    }

    #[test]
    fn test_predicted_contacts_stay_ordered() {
        let mut schedule = create_test_schedule();
        schedule.add_predicted(A, C, 100.0, 120.0, 50);
        schedule.add_predicted(A, B, 20.0, 40.0, 50);
        schedule.record_up(A, B, 5.0, 80);

        let starts: Vec<_> = schedule.records(A).iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![5.0, 20.0, 100.0]);
        assert_eq!(
            schedule.contacts_at(A, 110.0),
            [B, C].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_next_contact_prefers_active_window() {
        let mut schedule = create_test_schedule();
        schedule.add_predicted(A, B, 20.0, 40.0, 50);
        schedule.add_predicted(A, B, 100.0, 140.0, 70);

        assert_eq!(schedule.next_contact(A, B, 0.0), Some((20.0, 50)));
        assert_eq!(schedule.next_contact(A, B, 30.0), Some((30.0, 50)));
        assert_eq!(schedule.next_contact(A, B, 40.0), Some((100.0, 70)));
        assert_eq!(schedule.next_contact(A, B, 150.0), None);
    }

    #[test]
    fn test_predicted_disconnect_uses_hold_factor() {
        let schedule = ContactSchedule::new(Arc::new(RoutingConfig::default().with_hold_factor(4.0)));
        assert_eq!(schedule.predicted_disconnect(10.0, 500, 100), 30.0);
    }

    #[test]
    fn test_graph_edges_carry_wait() {
        let mut schedule = create_test_schedule();
        schedule.record_up(A, B, 0.0, 100);
        schedule.add_predicted(A, C, 30.0, 50.0, 100);

        let graph = ContactGraph::new(&schedule, 5.0, 100.0);
        let edges = graph.edges(A, 10.0);
        assert_eq!(edges.len(), 2);
        let to_b = edges.iter().find(|e| e.to == B).unwrap();
        let to_c = edges.iter().find(|e| e.to == C).unwrap();
        assert_eq!(to_b.depart_at, Some(10.0));
        assert_eq!(to_c.depart_at, Some(30.0));

        // window already closed by the horizon sweep start
        assert!(graph.edges(C, 60.0).is_empty());
    }

    #[test]
    fn test_graph_sweep_stops_after_last_contact() {
        let mut schedule = create_test_schedule();
        schedule.record_up(A, B, 0.0, 100);
        schedule.add_predicted(A, C, 30.0, 50.0, 100);

        let near = ContactGraph::new(&schedule, 1.0, 100.0).edges(A, 10.0);
        // a sweep to this horizon would never finish one step at a time
        let far = ContactGraph::new(&schedule, 1.0, 1.0e15).edges(A, 10.0);
        assert_eq!(far, near);
        assert_eq!(schedule.last_start(A), Some(30.0));
        assert_eq!(schedule.last_start(NodeAddress(9)), None);
        assert!(ContactGraph::new(&schedule, 1.0, 1.0e15).edges(NodeAddress(9), 0.0).is_empty());
    }

    #[test]
    fn test_connection_check_releases_idle_links() {
        let config = Arc::new(
            RoutingConfig::default()
                .with_mode(ConnectivityMode::AllConnected)
                .with_uniform_interfaces(Medium::Radio, 100.0, 1_000),
        );
        let mut links = LinkManager::new(config.clone());
        links.register_node(A, Tier::Low);
        links.register_node(B, Tier::Low);
        let mut schedule = ContactSchedule::new(config);
        let mut dir = ClusterMap::new();
        dir.add_node(A, Tier::Low, 0).add_node(B, Tier::Low, 0);
        let positions = PositionTable::new()
            .with(A, 0.0, 0.0, 0.0)
            .with(B, 10.0, 0.0, 0.0);
        let clock = FixedClock::new(0.0);
        let env = Environment::new(&clock, &positions, &dir);
        let mut buffer = OutgoingQueues::new();

        let id = links
            .try_connect(
                InterfaceId::new(A, Medium::Radio),
                InterfaceId::new(B, Medium::Radio),
                &env,
            )
            .link()
            .unwrap();
        schedule.record_up(A, B, 0.0, 1_000);
        let hold = links.link(id).unwrap().disconnect_at();

        let early = schedule
            .connection_check(A, hold - 0.5, &mut links, &mut buffer)
            .unwrap();
        assert!(early.is_empty());

        let released = schedule
            .connection_check(A, hold, &mut links, &mut buffer)
            .unwrap();
        assert_eq!(released.iter().map(|l| l.id).collect::<Vec<_>>(), vec![id]);
        assert_eq!(links.link_count(), 0);
        assert_eq!(schedule.records(A)[0].end, Some(hold));
    }
}
