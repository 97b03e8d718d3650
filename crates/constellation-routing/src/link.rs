//! Link lifecycle per node interface
//!
//! A link joins two same-medium interfaces that are in range, both
//! scanning, and allowed to pair under the connectivity mode. Speed is the
//! slower endpoint's. A node may hold many links but carries at most one
//! transfer at a time; an in-flight message on a torn-down link goes back
//! to the sender's outgoing buffer.

use crate::collaborators::{ClusterDirectory, Environment, MessageBuffer, TransferStart, Transport};
use crate::config::{transmit_time, ConnectivityMode, RoutingConfig};
use crate::types::{Medium, Message, MessageId, NodeAddress, SimTime, Tier};
use crate::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// One interface per medium per node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceId {
    pub node: NodeAddress,
    pub medium: Medium,
}

impl InterfaceId {
    pub fn new(node: NodeAddress, medium: Medium) -> Self {
        Self { node, medium }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,
    /// Transmit range (km)
    pub range: f64,
    /// Transmit speed (bytes/s)
    pub speed: u64,
    /// Scanning/listening for new peers
    pub scanning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Message currently riding a link
#[derive(Debug, Clone)]
pub struct InFlight {
    pub message: Message,
    pub sender: NodeAddress,
    pub started_at: SimTime,
    pub done_at: SimTime,
}

/// Undirected link between two interfaces
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub a: InterfaceId,
    pub b: InterfaceId,
    /// Negotiated speed, min of both endpoints (bytes/s)
    pub speed: u64,
    pub established_at: SimTime,
    disconnect_at: SimTime,
    in_flight: Option<InFlight>,
}

impl Link {
    pub fn medium(&self) -> Medium {
        self.a.medium
    }

    pub fn endpoints(&self) -> (NodeAddress, NodeAddress) {
        (self.a.node, self.b.node)
    }

    pub fn other(&self, node: NodeAddress) -> Option<NodeAddress> {
        if self.a.node == node {
            Some(self.b.node)
        } else if self.b.node == node {
            Some(self.a.node)
        } else {
            None
        }
    }

    pub fn joins(&self, x: NodeAddress, y: NodeAddress) -> bool {
        (self.a.node == x && self.b.node == y) || (self.a.node == y && self.b.node == x)
    }

    /// Scheduled disconnect time shared by both endpoints
    pub fn disconnect_at(&self) -> SimTime {
        self.disconnect_at
    }

    pub fn is_transferring(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefuseReason {
    SelfLink,
    UnknownInterface,
    NotScanning,
    MediumMismatch,
    NoPosition,
    OutOfRange,
    RoleGated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(LinkId),
    /// Pair already joined; nothing changed
    AlreadyLinked(LinkId),
    Refused(RefuseReason),
}

impl ConnectOutcome {
    pub fn link(&self) -> Option<LinkId> {
        match self {
            ConnectOutcome::Connected(id) | ConnectOutcome::AlreadyLinked(id) => Some(*id),
            ConnectOutcome::Refused(_) => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected(_))
    }
}

/// Completed transfer handed back to the tick driver
#[derive(Debug, Clone)]
pub struct Delivery {
    pub link: LinkId,
    pub from: NodeAddress,
    pub to: NodeAddress,
    pub message: Message,
    pub delivered_at: SimTime,
}

/// Link changes made by one `update` pass
#[derive(Debug, Clone, Default)]
pub struct LinkUpdate {
    pub torn_down: Vec<Link>,
    pub connected: Vec<LinkId>,
    /// In-flight messages returned to their senders
    pub returned: Vec<MessageId>,
}

pub struct LinkManager {
    config: Arc<RoutingConfig>,
    interfaces: BTreeMap<InterfaceId, Interface>,
    links: BTreeMap<LinkId, Link>,
    by_node: BTreeMap<NodeAddress, BTreeSet<LinkId>>,
    next_id: u64,
}

impl LinkManager {
    pub fn new(config: Arc<RoutingConfig>) -> Self {
        Self {
            config,
            interfaces: BTreeMap::new(),
            links: BTreeMap::new(),
            by_node: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Create the node's interfaces from the tier's profiles
    pub fn register_node(&mut self, node: NodeAddress, tier: Tier) -> Vec<InterfaceId> {
        let mut created = Vec::new();
        for profile in self.config.profiles_for(tier) {
            let id = InterfaceId::new(node, profile.medium);
            self.interfaces.insert(
                id,
                Interface {
                    id,
                    range: profile.range,
                    speed: profile.speed,
                    scanning: true,
                },
            );
            created.push(id);
        }
        self.by_node.entry(node).or_default();
        created
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.by_node.keys().copied()
    }

    pub fn is_registered(&self, node: NodeAddress) -> bool {
        self.by_node.contains_key(&node)
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(&id)
    }

    pub fn interfaces_of(&self, node: NodeAddress) -> impl Iterator<Item = &Interface> {
        self.interfaces
            .range(InterfaceId::new(node, Medium::Radio)..=InterfaceId::new(node, Medium::Laser))
            .map(|(_, iface)| iface)
    }

    pub fn set_scanning(&mut self, id: InterfaceId, scanning: bool) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id)
            .ok_or(RoutingError::UnknownNode(id.node))?;
        iface.scanning = scanning;
        Ok(())
    }

    pub fn set_speed(&mut self, id: InterfaceId, speed: u64) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id)
            .ok_or(RoutingError::UnknownNode(id.node))?;
        iface.speed = speed;
        Ok(())
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links_of(&self, node: NodeAddress) -> impl Iterator<Item = &Link> {
        self.by_node
            .get(&node)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.links.get(id))
    }

    /// Live link between two nodes, optionally restricted to one medium
    pub fn link_between(
        &self,
        a: NodeAddress,
        b: NodeAddress,
        medium: Option<Medium>,
    ) -> Option<&Link> {
        self.links_of(a)
            .find(|l| l.joins(a, b) && medium.map_or(true, |m| l.medium() == m))
    }

    /// Peers with a live link, optionally restricted to one medium
    pub fn neighbors(&self, node: NodeAddress, medium: Option<Medium>) -> BTreeSet<NodeAddress> {
        self.links_of(node)
            .filter(|l| medium.map_or(true, |m| l.medium() == m))
            .filter_map(|l| l.other(node))
            .collect()
    }

    pub fn node_is_transferring(&self, node: NodeAddress) -> bool {
        self.links_of(node).any(|l| l.is_transferring())
    }

    /// When the node's current transfer finishes
    pub fn busy_until(&self, node: NodeAddress) -> Option<SimTime> {
        self.links_of(node)
            .filter_map(|l| l.in_flight.as_ref().map(|f| f.done_at))
            .reduce(f64::max)
    }

    /// Range, medium, scan and role checks, without touching state
    pub fn check_pairing(
        &self,
        a: InterfaceId,
        b: InterfaceId,
        env: &Environment<'_>,
    ) -> std::result::Result<u64, RefuseReason> {
        if a.node == b.node {
            return Err(RefuseReason::SelfLink);
        }
        let (ia, ib) = match (self.interfaces.get(&a), self.interfaces.get(&b)) {
            (Some(ia), Some(ib)) => (ia, ib),
            _ => return Err(RefuseReason::UnknownInterface),
        };
        if a.medium != b.medium {
            return Err(RefuseReason::MediumMismatch);
        }
        if !ia.scanning || !ib.scanning {
            return Err(RefuseReason::NotScanning);
        }
        let distance = env
            .positions
            .distance(a.node, b.node)
            .ok_or(RefuseReason::NoPosition)?;
        if distance > ia.range.min(ib.range) {
            return Err(RefuseReason::OutOfRange);
        }
        if !self.roles_permit(a.node, b.node, env.directory) {
            return Err(RefuseReason::RoleGated);
        }
        Ok(ia.speed.min(ib.speed))
    }

    /// Whether the connectivity mode allows the pair at all
    pub fn roles_permit(&self, a: NodeAddress, b: NodeAddress, dir: &dyn ClusterDirectory) -> bool {
        match self.config.mode {
            ConnectivityMode::AllConnected => true,
            ConnectivityMode::Cluster => role_allows(dir, a, b) && role_allows(dir, b, a),
        }
    }

    /// Join two interfaces. Self links and existing pairs are no-ops.
    pub fn try_connect(
        &mut self,
        a: InterfaceId,
        b: InterfaceId,
        env: &Environment<'_>,
    ) -> ConnectOutcome {
        if let Some(existing) = self.link_between(a.node, b.node, Some(a.medium)) {
            return ConnectOutcome::AlreadyLinked(existing.id);
        }
        let speed = match self.check_pairing(a, b, env) {
            Ok(speed) => speed,
            Err(reason) => return ConnectOutcome::Refused(reason),
        };

        let now = env.now();
        let id = LinkId(self.next_id);
        self.next_id += 1;
        let link = Link {
            id,
            a,
            b,
            speed,
            established_at: now,
            disconnect_at: self
                .config
                .hold_until(now, self.config.nominal_message_size, speed),
            in_flight: None,
        };
        debug!(link = %id, a = %a.node, b = %b.node, medium = ?a.medium, speed, "link up");
        self.links.insert(id, link);
        self.by_node.entry(a.node).or_default().insert(id);
        self.by_node.entry(b.node).or_default().insert(id);
        ConnectOutcome::Connected(id)
    }

    /// Remove a link; an in-flight message goes back to its sender
    pub fn disconnect(&mut self, id: LinkId, buffer: &mut dyn MessageBuffer) -> Result<Link> {
        let mut link = self.links.remove(&id).ok_or(RoutingError::UnknownLink(id))?;
        for node in [link.a.node, link.b.node] {
            if let Some(ids) = self.by_node.get_mut(&node) {
                ids.remove(&id);
            }
        }
        if let Some(flight) = link.in_flight.take() {
            debug!(link = %id, sender = %flight.sender, message = %flight.message.id, "returning in-flight message");
            buffer.requeue(flight.sender, flight.message);
        }
        debug!(link = %id, "link down");
        Ok(link)
    }

    /// Links at `node` whose endpoints are no longer within range
    pub fn out_of_range(&self, node: NodeAddress, env: &Environment<'_>) -> Vec<LinkId> {
        self.links_of(node)
            .filter(|l| {
                let range = match (self.interfaces.get(&l.a), self.interfaces.get(&l.b)) {
                    (Some(ia), Some(ib)) => ia.range.min(ib.range),
                    _ => return true,
                };
                env.positions
                    .distance(l.a.node, l.b.node)
                    .map_or(true, |d| d > range)
            })
            .map(|l| l.id)
            .collect()
    }

    /// Interface pairs `node` could connect this tick
    pub fn candidates(
        &self,
        node: NodeAddress,
        env: &Environment<'_>,
    ) -> Vec<(InterfaceId, InterfaceId)> {
        let mut pairs = Vec::new();
        for local in self.interfaces_of(node).filter(|i| i.scanning) {
            for peer in self.interfaces.values() {
                if peer.id.node == node || peer.id.medium != local.id.medium {
                    continue;
                }
                if self
                    .link_between(node, peer.id.node, Some(local.id.medium))
                    .is_some()
                {
                    continue;
                }
                if self.check_pairing(local.id, peer.id, env).is_ok() {
                    pairs.push((local.id, peer.id));
                }
            }
        }
        pairs
    }

    /// Per-tick pass: teardown of out-of-range links, then new connections.
    ///
    /// Link table only. Contacts opened or closed here are not recorded in
    /// a [`ContactSchedule`](crate::ContactSchedule); the routing engine
    /// runs the same phases itself so it can record them and drop stale
    /// routes.
    pub fn update(
        &mut self,
        node: NodeAddress,
        env: &Environment<'_>,
        buffer: &mut dyn MessageBuffer,
    ) -> Result<LinkUpdate> {
        if let Err(err) = self.check_invariants() {
            warn!(node = %node, error = %err, "link table inconsistent, rebuilding index");
            self.repair_index();
        }

        let mut result = self.teardown_out_of_range(node, env, buffer)?;
        let pairs = self.candidates(node, env);
        result.connected = self.apply_candidates(&pairs, env);
        Ok(result)
    }

    pub fn teardown_out_of_range(
        &mut self,
        node: NodeAddress,
        env: &Environment<'_>,
        buffer: &mut dyn MessageBuffer,
    ) -> Result<LinkUpdate> {
        let mut result = LinkUpdate::default();
        for id in self.out_of_range(node, env) {
            if let Some(msg) = self.links.get(&id).and_then(|l| l.in_flight.as_ref()) {
                result.returned.push(msg.message.id.clone());
            }
            result.torn_down.push(self.disconnect(id, buffer)?);
        }
        Ok(result)
    }

    /// Connect candidate pairs in the given order
    pub fn apply_candidates(
        &mut self,
        pairs: &[(InterfaceId, InterfaceId)],
        env: &Environment<'_>,
    ) -> Vec<LinkId> {
        pairs
            .iter()
            .filter_map(|&(a, b)| match self.try_connect(a, b, env) {
                ConnectOutcome::Connected(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Offer a queued message over a link and, if accepted, put it in flight
    pub fn start_transfer(
        &mut self,
        id: LinkId,
        sender: NodeAddress,
        message_id: &MessageId,
        now: SimTime,
        buffer: &mut dyn MessageBuffer,
        transport: &mut dyn Transport,
    ) -> Result<TransferStart> {
        let link = self.links.get(&id).ok_or(RoutingError::UnknownLink(id))?;
        let receiver = link.other(sender).ok_or_else(|| {
            RoutingError::InvariantViolation(format!("{sender} is not an endpoint of {id}"))
        })?;
        if self.node_is_transferring(sender) || self.node_is_transferring(receiver) {
            return Ok(TransferStart::Defer);
        }
        let message = buffer
            .message_mut(sender, message_id)
            .ok_or_else(|| RoutingError::UnknownMessage(message_id.clone()))?;
        let verdict = transport.start_transfer(message, link);
        if verdict != TransferStart::Ok {
            return Ok(verdict);
        }

        let message = buffer
            .take(sender, message_id)
            .ok_or_else(|| RoutingError::UnknownMessage(message_id.clone()))?;
        let hold = self.config.hold_until(now, message.size, link.speed);
        let done_at = now + transmit_time(message.size, link.speed);
        if let Some(link) = self.links.get_mut(&id) {
            link.disconnect_at = link.disconnect_at.max(hold);
            debug!(link = %id, sender = %sender, message = %message.id, done_at, "transfer started");
            link.in_flight = Some(InFlight {
                message,
                sender,
                started_at: now,
                done_at,
            });
        }
        Ok(TransferStart::Ok)
    }

    /// Finish every transfer due by `now`
    pub fn complete_due(&mut self, now: SimTime) -> Vec<Delivery> {
        let mut done = Vec::new();
        for link in self.links.values_mut() {
            let due = link.in_flight.as_ref().is_some_and(|f| f.done_at <= now);
            if !due {
                continue;
            }
            if let Some(flight) = link.in_flight.take() {
                let to = link.other(flight.sender).unwrap_or(flight.sender);
                done.push(Delivery {
                    link: link.id,
                    from: flight.sender,
                    to,
                    message: flight.message,
                    delivered_at: flight.done_at,
                });
            }
        }
        done
    }

    /// Idle links whose scheduled disconnect time has passed
    pub fn expired_idle(&self, node: NodeAddress, now: SimTime) -> Vec<LinkId> {
        self.links_of(node)
            .filter(|l| !l.is_transferring() && l.disconnect_at <= now)
            .map(|l| l.id)
            .collect()
    }

    /// Verify the node index against the link table
    pub fn check_invariants(&self) -> Result<()> {
        for link in self.links.values() {
            if link.a.node == link.b.node {
                return Err(RoutingError::InvariantViolation(format!(
                    "{} joins {} to itself",
                    link.id, link.a.node
                )));
            }
            for node in [link.a.node, link.b.node] {
                let indexed = self.by_node.get(&node).is_some_and(|ids| ids.contains(&link.id));
                if !indexed {
                    return Err(RoutingError::InvariantViolation(format!(
                        "{} missing from index of {}",
                        link.id, node
                    )));
                }
            }
        }
        for (node, ids) in &self.by_node {
            for id in ids {
                match self.links.get(id) {
                    Some(l) if l.other(*node).is_some() => {}
                    _ => {
                        return Err(RoutingError::InvariantViolation(format!(
                            "{node} tracks {id} which is not up"
                        )))
                    }
                }
            }
            let transferring = ids
                .iter()
                .filter_map(|id| self.links.get(id))
                .filter(|l| l.is_transferring())
                .count();
            if transferring > 1 {
                return Err(RoutingError::InvariantViolation(format!(
                    "{node} has {transferring} concurrent transfers"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn repair_index(&mut self) {
        for ids in self.by_node.values_mut() {
            ids.clear();
        }
        for link in self.links.values() {
            self.by_node.entry(link.a.node).or_default().insert(link.id);
            self.by_node.entry(link.b.node).or_default().insert(link.id);
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_index_for_test(&mut self, node: NodeAddress, id: LinkId) {
        self.by_node.entry(node).or_default().insert(id);
    }
}

fn role_allows(dir: &dyn ClusterDirectory, me: NodeAddress, peer: NodeAddress) -> bool {
    match dir.tier(me) {
        None => false,
        Some(Tier::Low) => {
            dir.managers(me).contains(&peer)
                || dir.plane_neighbors(me).contains(&peer)
                || dir.cross_plane_neighbors(me).contains(&peer)
        }
        Some(_) => {
            dir.tier(peer).is_some_and(|t| t.is_upper()) || dir.managed(me).contains(&peer)
        }
    }
}
