//! Tier-scoped topology views
//!
//! The search never runs over the whole constellation. Each source tier
//! has a strategy that lists candidate scopes, narrowest first:
//!
//! - Ring: the source's orbital plane
//! - NeighborPlane: two adjacent rings joined by live cross-plane links
//! - Relay: managers and upper-tier meshes, climbing until the
//!   destination's tier is reached
//! - Direct: a single live link to a managed member
//!
//! A [`ScopeKey`] fully describes a scope, so tables can be cached by key
//! and a snapshot is only built when the cache misses.

use crate::collaborators::ClusterDirectory;
use crate::config::RoutingConfig;
use crate::link::LinkManager;
use crate::search::{Adjacency, Edge};
use crate::types::{Medium, NodeAddress, PlaneId, SimTime, Tier};
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;
use std::collections::BTreeSet;

/// Identity of a search scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ScopeKey {
    /// Every live link on the medium
    Live,
    /// Known and predicted contacts up to a horizon (whole seconds)
    Contacts {
        horizon: u64,
    },
    Ring {
        tier: Tier,
        plane: PlaneId,
    },
    NeighborPlane {
        tier: Tier,
        from: PlaneId,
        to: PlaneId,
    },
    Relay {
        from: Tier,
        to: Tier,
        destination: NodeAddress,
    },
    Direct {
        peer: NodeAddress,
    },
}

/// Adjacency snapshot handed to the search for one computation.
/// Edge weights are transmit speeds (bytes/s).
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    scope: ScopeKey,
    graph: DiGraphMap<NodeAddress, u64>,
}

impl TopologySnapshot {
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            graph: DiGraphMap::new(),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn add_node(&mut self, node: NodeAddress) {
        self.graph.add_node(node);
    }

    /// Undirected edge, stored as two arcs
    pub fn add_link(&mut self, a: NodeAddress, b: NodeAddress, speed: u64) {
        if a == b {
            return;
        }
        self.graph.add_edge(a, b, speed);
        self.graph.add_edge(b, a, speed);
    }

    pub fn contains(&self, node: NodeAddress) -> bool {
        self.graph.contains_node(node)
    }

    pub fn has_link(&self, a: NodeAddress, b: NodeAddress) -> bool {
        self.graph.contains_edge(a, b)
    }

    pub fn neighbors(&self, node: NodeAddress) -> BTreeSet<NodeAddress> {
        if !self.contains(node) {
            return BTreeSet::new();
        }
        self.graph.neighbors(node).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.graph.nodes()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Undirected link count
    pub fn link_count(&self) -> usize {
        self.graph.edge_count() / 2
    }
}

impl Adjacency for TopologySnapshot {
    fn edges(&self, from: NodeAddress, _at: SimTime) -> Vec<Edge> {
        if !self.contains(from) {
            return Vec::new();
        }
        self.graph
            .edges(from)
            .map(|(_, to, &speed)| Edge {
                to,
                speed,
                depart_at: None,
            })
            .collect()
    }

    fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

/// Collaborators a view reads while planning and building scopes
#[derive(Clone, Copy)]
pub struct ViewContext<'a> {
    pub directory: &'a dyn ClusterDirectory,
    pub links: &'a LinkManager,
    pub config: &'a RoutingConfig,
    /// Medium the message will travel on
    pub medium: Medium,
}

impl<'a> ViewContext<'a> {
    pub fn new(
        directory: &'a dyn ClusterDirectory,
        links: &'a LinkManager,
        config: &'a RoutingConfig,
        medium: Medium,
    ) -> Self {
        Self {
            directory,
            links,
            config,
            medium,
        }
    }

    /// Speed of the live link, else the slower endpoint's profile speed
    pub fn speed(&self, a: NodeAddress, b: NodeAddress) -> Option<u64> {
        if let Some(link) = self.links.link_between(a, b, Some(self.medium)) {
            return Some(link.speed);
        }
        let ta = self.directory.tier(a)?;
        let tb = self.directory.tier(b)?;
        let sa = self.config.profile(ta, self.medium)?.speed;
        let sb = self.config.profile(tb, self.medium)?.speed;
        Some(sa.min(sb))
    }

    pub fn has_live_link(&self, a: NodeAddress, b: NodeAddress) -> bool {
        self.links.link_between(a, b, Some(self.medium)).is_some()
    }

    fn link(&self, snapshot: &mut TopologySnapshot, a: NodeAddress, b: NodeAddress) {
        if let Some(speed) = self.speed(a, b) {
            snapshot.add_link(a, b, speed);
        }
    }

    fn ring(&self, snapshot: &mut TopologySnapshot, tier: Tier, plane: PlaneId) {
        for node in self.directory.plane_members(tier, plane) {
            snapshot.add_node(node);
            for peer in self.directory.plane_neighbors(node) {
                if self.directory.plane(peer) == Some(plane) && self.directory.tier(peer) == Some(tier) {
                    self.link(snapshot, node, peer);
                }
            }
        }
    }

    fn mesh(&self, snapshot: &mut TopologySnapshot, tier: Tier) {
        for node in self.directory.members(tier) {
            snapshot.add_node(node);
            let peers = self
                .directory
                .plane_neighbors(node)
                .into_iter()
                .chain(self.directory.cross_plane_neighbors(node));
            for peer in peers {
                if self.directory.tier(peer) == Some(tier) {
                    self.link(snapshot, node, peer);
                }
            }
        }
    }

    fn uplinks(&self, snapshot: &mut TopologySnapshot, node: NodeAddress) {
        snapshot.add_node(node);
        for manager in self.directory.managers(node) {
            self.link(snapshot, node, manager);
        }
    }

    /// Build the snapshot a key describes, as seen from `source`
    pub fn build(&self, key: &ScopeKey, source: NodeAddress) -> TopologySnapshot {
        let mut snapshot = TopologySnapshot::new(key.clone());
        snapshot.add_node(source);
        match *key {
            ScopeKey::Live | ScopeKey::Contacts { .. } => {
                for link in self.links.links().filter(|l| l.medium() == self.medium) {
                    let (a, b) = link.endpoints();
                    snapshot.add_link(a, b, link.speed);
                }
            }
            ScopeKey::Ring { tier, plane } => self.ring(&mut snapshot, tier, plane),
            ScopeKey::NeighborPlane { tier, from, to } => {
                self.ring(&mut snapshot, tier, from);
                self.ring(&mut snapshot, tier, to);
                for node in self.directory.plane_members(tier, from) {
                    for peer in self.links.neighbors(node, Some(self.medium)) {
                        if self.directory.tier(peer) == Some(tier)
                            && self.directory.plane(peer) == Some(to)
                        {
                            self.link(&mut snapshot, node, peer);
                        }
                    }
                }
            }
            ScopeKey::Relay {
                from,
                to,
                destination,
            } => {
                snapshot.add_node(destination);
                let lowest = from.min(to).max(Tier::Medium);
                let highest = from.max(to).max(Tier::Medium);
                for tier in Tier::ALL.into_iter().filter(|t| (lowest..=highest).contains(t)) {
                    self.mesh(&mut snapshot, tier);
                    if tier < highest {
                        for member in self.directory.members(tier) {
                            self.uplinks(&mut snapshot, member);
                        }
                    }
                }
                if from == Tier::Low {
                    self.uplinks(&mut snapshot, source);
                }
                if to == Tier::Low {
                    self.uplinks(&mut snapshot, destination);
                }
            }
            ScopeKey::Direct { peer } => {
                if let Some(link) = self.links.link_between(source, peer, Some(self.medium)) {
                    snapshot.add_link(source, peer, link.speed);
                }
            }
        }
        snapshot
    }

    /// Ring or neighbor-plane scope when both ends share a tier
    fn same_tier_scope(&self, source: NodeAddress, destination: NodeAddress) -> Option<ScopeKey> {
        let tier = self.directory.tier(source)?;
        if self.directory.tier(destination)? != tier {
            return None;
        }
        let from = self.directory.plane(source)?;
        let to = self.directory.plane(destination)?;
        if from == to {
            Some(ScopeKey::Ring { tier, plane: from })
        } else if self.directory.planes_adjacent(tier, from, to) {
            Some(ScopeKey::NeighborPlane { tier, from, to })
        } else {
            None
        }
    }

    fn relay(&self, source: NodeAddress, destination: NodeAddress) -> Option<ScopeKey> {
        Some(ScopeKey::Relay {
            from: self.directory.tier(source)?,
            to: self.directory.tier(destination)?,
            destination,
        })
    }

    /// Destination is a Low node with no manager: nothing upstream can reach it
    fn is_isolated(&self, destination: NodeAddress) -> bool {
        self.directory.tier(destination) == Some(Tier::Low)
            && self.directory.managers(destination).is_empty()
    }
}

/// Per-tier scope strategy
pub trait TopologyView: Send + Sync {
    fn tier(&self) -> Tier;

    /// Scopes to try in order until one reaches the destination
    fn plan(&self, ctx: &ViewContext<'_>, source: NodeAddress, destination: NodeAddress) -> Vec<ScopeKey>;

    /// Next hops that may take the message when every scope fails
    fn fallback_relays(
        &self,
        _ctx: &ViewContext<'_>,
        _source: NodeAddress,
        _destination: NodeAddress,
    ) -> Vec<NodeAddress> {
        Vec::new()
    }
}

/// Low tier: own ring first, then the managers' relay network
#[derive(Debug, Clone, Copy, Default)]
pub struct LowTierView;

impl TopologyView for LowTierView {
    fn tier(&self) -> Tier {
        Tier::Low
    }

    fn plan(&self, ctx: &ViewContext<'_>, source: NodeAddress, destination: NodeAddress) -> Vec<ScopeKey> {
        ctx.same_tier_scope(source, destination)
            .into_iter()
            .chain(ctx.relay(source, destination))
            .collect()
    }

    /// Live managers, unless the destination cannot be reached from above
    fn fallback_relays(
        &self,
        ctx: &ViewContext<'_>,
        source: NodeAddress,
        destination: NodeAddress,
    ) -> Vec<NodeAddress> {
        if ctx.is_isolated(destination) {
            return Vec::new();
        }
        ctx.directory
            .managers(source)
            .into_iter()
            .filter(|&m| ctx.has_live_link(source, m))
            .collect()
    }
}

/// Medium tier: managed members directly, else the mesh
#[derive(Debug, Clone, Copy, Default)]
pub struct MediumTierView;

impl TopologyView for MediumTierView {
    fn tier(&self) -> Tier {
        Tier::Medium
    }

    fn plan(&self, ctx: &ViewContext<'_>, source: NodeAddress, destination: NodeAddress) -> Vec<ScopeKey> {
        let mut plan = Vec::new();
        if ctx.directory.managed(source).contains(&destination) && ctx.has_live_link(source, destination) {
            plan.push(ScopeKey::Direct { peer: destination });
        }
        plan.extend(ctx.same_tier_scope(source, destination));
        plan.extend(ctx.relay(source, destination));
        plan
    }

    /// Any live upper-tier neighbor, for upper-tier destinations
    fn fallback_relays(
        &self,
        ctx: &ViewContext<'_>,
        source: NodeAddress,
        destination: NodeAddress,
    ) -> Vec<NodeAddress> {
        if !ctx.directory.tier(destination).is_some_and(|t| t.is_upper()) {
            return Vec::new();
        }
        ctx.links
            .neighbors(source, Some(ctx.medium))
            .into_iter()
            .filter(|&n| ctx.directory.tier(n).is_some_and(|t| t.is_upper()))
            .collect()
    }
}

/// High tier: own mesh, descending through managed members
#[derive(Debug, Clone, Copy, Default)]
pub struct HighTierView;

impl TopologyView for HighTierView {
    fn tier(&self) -> Tier {
        Tier::High
    }

    fn plan(&self, ctx: &ViewContext<'_>, source: NodeAddress, destination: NodeAddress) -> Vec<ScopeKey> {
        let mut plan = Vec::new();
        if ctx.directory.managed(source).contains(&destination) && ctx.has_live_link(source, destination) {
            plan.push(ScopeKey::Direct { peer: destination });
        }
        plan.extend(ctx.same_tier_scope(source, destination));
        plan.extend(ctx.relay(source, destination));
        plan
    }
}

/// Strategy lookup by tier
#[derive(Debug, Clone, Copy, Default)]
pub struct TierViews {
    low: LowTierView,
    medium: MediumTierView,
    high: HighTierView,
}

impl TierViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tier(&self, tier: Tier) -> &dyn TopologyView {
        match tier {
            Tier::Low => &self.low,
            Tier::Medium => &self.medium,
            Tier::High => &self.high,
        }
    }
}
