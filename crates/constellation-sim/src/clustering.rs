//! Constellation layout and dynamic cluster membership
//!
//! Rings and cross-plane neighbors are fixed by the Walker layout.
//! Managers change every tick: each low node follows the nearest medium
//! node in range, each medium node the nearest high node.

use crate::scenario::Scenario;
use crate::Result;
use constellation_routing::collaborators::in_memory::{ClusterMap, PositionTable};
use constellation_routing::{Medium, NodeAddress, PlaneId, Positions, RoutingConfig, Tier};
use orbital_mechanics::CircularOrbit;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SatNode {
    pub address: NodeAddress,
    pub tier: Tier,
    pub plane: PlaneId,
    pub slot: u16,
    pub orbit: CircularOrbit,
}

/// Every node of the three shells, addressed from 1 in tier order
#[derive(Debug, Clone)]
pub struct Constellation {
    nodes: Vec<SatNode>,
}

impl Constellation {
    pub fn from_scenario(scenario: &Scenario) -> Result<Self> {
        let mut nodes = Vec::with_capacity(scenario.node_count());
        let mut next = 1u32;
        for tier in Tier::ALL {
            for slot in scenario.shell(tier).slots()? {
                nodes.push(SatNode {
                    address: NodeAddress(next),
                    tier,
                    plane: slot.plane,
                    slot: slot.slot,
                    orbit: slot.orbit,
                });
                next += 1;
            }
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[SatNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn of_tier(&self, tier: Tier) -> impl Iterator<Item = &SatNode> + '_ {
        self.nodes.iter().filter(move |n| n.tier == tier)
    }

    pub fn addresses(&self, tier: Tier) -> Vec<NodeAddress> {
        self.of_tier(tier).map(|n| n.address).collect()
    }

    pub fn positions_at(&self, t: f64) -> PositionTable {
        let mut table = PositionTable::new();
        for node in &self.nodes {
            table.set(node.address, node.orbit.position_at(t));
        }
        table
    }
}

/// Longest distance at which two tiers share a usable medium
pub fn link_range(config: &RoutingConfig, a: Tier, b: Tier) -> f64 {
    [Medium::Radio, Medium::Laser]
        .iter()
        .filter_map(|&m| Some(config.profile(a, m)?.range.min(config.profile(b, m)?.range)))
        .fold(0.0, f64::max)
}

pub struct Clustering {
    directory: ClusterMap,
    /// Manager search radius per member tier
    manager_range: BTreeMap<Tier, f64>,
}

impl Clustering {
    pub fn build(constellation: &Constellation, config: &RoutingConfig, cross_plane: bool) -> Self {
        let mut directory = ClusterMap::new();
        let mut rings: BTreeMap<(Tier, PlaneId), Vec<&SatNode>> = BTreeMap::new();
        for node in constellation.nodes() {
            directory.add_node(node.address, node.tier, node.plane);
            rings.entry((node.tier, node.plane)).or_default().push(node);
        }

        for members in rings.values_mut() {
            members.sort_by_key(|n| n.slot);
            let ring: Vec<NodeAddress> = members.iter().map(|n| n.address).collect();
            directory.ring(&ring);
        }

        if cross_plane {
            let planes = constellation
                .of_tier(Tier::Low)
                .map(|n| n.plane + 1)
                .max()
                .unwrap_or(0);
            if planes > 1 {
                let by_slot: BTreeMap<(PlaneId, u16), NodeAddress> = constellation
                    .of_tier(Tier::Low)
                    .map(|n| ((n.plane, n.slot), n.address))
                    .collect();
                for (&(plane, slot), &node) in &by_slot {
                    if let Some(&peer) = by_slot.get(&((plane + 1) % planes, slot)) {
                        directory.link_cross(node, peer);
                    }
                }
            }
        }

        let manager_range = [Tier::Low, Tier::Medium]
            .into_iter()
            .filter_map(|t| Some((t, link_range(config, t, t.up()?))))
            .collect();

        Self {
            directory,
            manager_range,
        }
    }

    pub fn directory(&self) -> &ClusterMap {
        &self.directory
    }

    /// Re-pick every manager from current positions. Returns how many changed.
    pub fn reassign(&mut self, constellation: &Constellation, positions: &PositionTable) -> usize {
        let mut changed = 0;
        for (&tier, &range) in &self.manager_range {
            let Some(upper) = tier.up() else { continue };
            let candidates = constellation.addresses(upper);
            for member in constellation.of_tier(tier) {
                let nearest = nearest_within(member.address, &candidates, range, positions);
                let previous = match nearest {
                    Some(manager) => self.directory.assign_manager(member.address, manager),
                    None => self.directory.clear_manager(member.address),
                };
                if previous != nearest {
                    changed += 1;
                    debug!(node = %member.address, from = ?previous, to = ?nearest, "manager changed");
                }
            }
        }
        changed
    }
}

/// Closest candidate within `range`; ties go to the lower address
fn nearest_within(
    node: NodeAddress,
    candidates: &[NodeAddress],
    range: f64,
    positions: &PositionTable,
) -> Option<NodeAddress> {
    let mut best: Option<(NodeAddress, f64)> = None;
    for &candidate in candidates {
        let Some(d) = positions.distance(node, candidate) else { continue };
        if d > range {
            continue;
        }
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((candidate, d));
        }
    }
    best.map(|(n, _)| n)
}
