//! Constellation Routing - contact-graph routing for multi-tier constellations
//!
//! Computes time-varying forwarding paths for a three-tier satellite
//! network (Low, Medium, High/geostationary) whose topology changes
//! every tick as nodes move in and out of range:
//!
//! - Link lifecycle (range test, speed negotiation, single-transfer channel)
//! - Contact schedule (realized and predicted contact intervals)
//! - Tier-scoped topology views built from cluster membership
//! - Earliest-arrival (temporal Dijkstra) search with seeded tie-break
//! - Per-message forwarding decisions (embedded path, table, busy deferral)
//!
//! Positions, clock, cluster membership, outgoing buffers and the byte
//! transfer itself are external collaborators, see [`collaborators`].

use thiserror::Error;

pub mod collaborators;
pub mod config;
pub mod contact;
pub mod engine;
pub mod forwarding;
pub mod link;
pub mod search;
pub mod topology;
pub mod types;

pub use collaborators::{
    Clock, ClusterDirectory, Environment, MessageBuffer, Positions, TransferStart, Transport,
};
pub use config::{ConnectivityMode, InterfaceProfile, RoutingConfig, SearchMode};
pub use contact::{ContactGraph, ContactRecord, ContactSchedule};
pub use engine::{NodeReport, RoutingEngine, TickReport};
pub use forwarding::{Forwarder, ForwardingOutcome, ForwardingState, PathSource};
pub use link::{ConnectOutcome, Delivery, InterfaceId, Link, LinkId, LinkManager, RefuseReason};
pub use search::{EarliestArrivalSearch, RouteCache, RouteEntry, RoutingTable, SearchRequest};
pub use topology::{ScopeKey, TierViews, TopologySnapshot, TopologyView};
pub use types::{Hop, HopPath, Medium, Message, MessageId, NodeAddress, PlaneId, SimTime, Tick, Tier};

/// Routing core errors
///
/// Busy next hops, stale paths and unreachable destinations are normal
/// operating states and surface as [`ForwardingOutcome`] variants instead.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeAddress),
    #[error("Unknown link: {0}")]
    UnknownLink(LinkId),
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, RoutingError>;
