//! Core value types shared by every routing component

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Simulated time in seconds
pub type SimTime = f64;

/// Discrete simulation step counter
pub type Tick = u64;

/// Orbital plane index within a tier
pub type PlaneId = u16;

/// Node identity, unique across all tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress(pub u32);

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u32> for NodeAddress {
    fn from(value: u32) -> Self {
        NodeAddress(value)
    }
}

/// Orbital tier of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Numerous short-range endpoints
    Low,
    /// Relays and cluster managers for the low tier
    Medium,
    /// Geostationary relays managing the medium tier
    High,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Low, Tier::Medium, Tier::High];

    /// Relay tiers (everything except Low)
    pub fn is_upper(self) -> bool {
        !matches!(self, Tier::Low)
    }

    /// The tier that manages this one
    pub fn up(self) -> Option<Tier> {
        match self {
            Tier::Low => Some(Tier::Medium),
            Tier::Medium => Some(Tier::High),
            Tier::High => None,
        }
    }

    /// The tier this one manages
    pub fn down(self) -> Option<Tier> {
        match self {
            Tier::Low => None,
            Tier::Medium => Some(Tier::Low),
            Tier::High => Some(Tier::Medium),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Low => "LEO",
            Tier::Medium => "MEO",
            Tier::High => "GEO",
        };
        f.write_str(name)
    }
}

/// Physical medium of an interface; radio and laser do not interoperate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Medium {
    Radio,
    Laser,
}

impl Medium {
    /// Medium used for a message of `size` bytes
    pub fn for_size(size: u64, threshold: u64) -> Medium {
        if size > threshold {
            Medium::Laser
        } else {
            Medium::Radio
        }
    }
}

/// One hop of a forwarding path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub address: NodeAddress,
    /// The hop depends on a future contact, so a missing link is not stale
    pub may_wait: bool,
}

impl Hop {
    pub fn new(address: NodeAddress, may_wait: bool) -> Self {
        Self { address, may_wait }
    }
}

/// Ordered hop list, source excluded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopPath(Vec<Hop>);

impl HopPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_hops(hops: Vec<Hop>) -> Self {
        Self(hops)
    }

    /// Copy of this path extended by one hop
    pub fn extended(&self, hop: Hop) -> Self {
        let mut hops = Vec::with_capacity(self.0.len() + 1);
        hops.extend_from_slice(&self.0);
        hops.push(hop);
        Self(hops)
    }

    pub fn hops(&self) -> &[Hop] {
        &self.0
    }

    pub fn first(&self) -> Option<&Hop> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&Hop> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: NodeAddress) -> bool {
        self.0.iter().any(|h| h.address == address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.0.iter().map(|h| h.address)
    }

    /// Hop following `node`, given that the path started at `origin`.
    ///
    /// Returns `None` when `node` is the final hop or not on the path.
    pub fn next_after(&self, origin: NodeAddress, node: NodeAddress) -> Option<Hop> {
        if node == origin {
            return self.first().copied();
        }
        let pos = self.0.iter().position(|h| h.address == node)?;
        self.0.get(pos + 1).copied()
    }

    /// True when no address repeats
    pub fn is_simple(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.0.len());
        self.0.iter().all(|h| seen.insert(h.address))
    }
}

/// Message identifier assigned by the buffer owner
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId(value)
    }
}

/// A message as seen by the routing core
///
/// The buffer owner controls the lifecycle; routing reads the destination
/// and size and may attach or clear the embedded path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub origin: NodeAddress,
    pub destination: NodeAddress,
    /// Size in bytes
    pub size: u64,
    pub created_at: SimTime,
    /// Time to live in seconds
    pub ttl: Option<SimTime>,
    embedded_path: Option<(NodeAddress, HopPath)>,
    busy_until: BTreeMap<NodeAddress, SimTime>,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        origin: NodeAddress,
        destination: NodeAddress,
        size: u64,
        created_at: SimTime,
    ) -> Self {
        Self {
            id: id.into(),
            origin,
            destination,
            size,
            created_at,
            ttl: None,
            embedded_path: None,
            busy_until: BTreeMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: SimTime) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_path(mut self, written_by: NodeAddress, path: HopPath) -> Self {
        self.embedded_path = Some((written_by, path));
        self
    }

    pub fn embedded_path(&self) -> Option<&HopPath> {
        self.embedded_path.as_ref().map(|(_, path)| path)
    }

    /// Node that computed the embedded path; the path starts after it
    pub fn path_writer(&self) -> Option<NodeAddress> {
        self.embedded_path.as_ref().map(|(writer, _)| *writer)
    }

    pub fn attach_path(&mut self, written_by: NodeAddress, path: HopPath) {
        self.embedded_path = Some((written_by, path));
    }

    /// Embedded next hop as seen from `node`
    pub fn embedded_next_hop(&self, node: NodeAddress) -> Option<Hop> {
        let (writer, path) = self.embedded_path.as_ref()?;
        path.next_after(*writer, node)
    }

    /// Drop the whole embedded path, wait flags included
    pub fn clear_path(&mut self) {
        self.embedded_path = None;
    }

    /// Absolute expiry time, if the message has a TTL
    pub fn expires_at(&self) -> Option<SimTime> {
        self.ttl.map(|ttl| self.created_at + ttl)
    }

    pub fn mark_busy(&mut self, recipient: NodeAddress, until: SimTime) {
        self.busy_until.insert(recipient, until);
    }

    pub fn busy_until(&self, recipient: NodeAddress) -> Option<SimTime> {
        self.busy_until.get(&recipient).copied()
    }

    /// True while any pending recipient is marked busy past `now`
    pub fn is_waiting(&self, now: SimTime) -> bool {
        self.busy_until.values().any(|&until| until > now)
    }

    pub fn clear_busy(&mut self) {
        self.busy_until.clear();
    }
}
