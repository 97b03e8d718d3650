//! Constellation Simulator
//!
//! Drives the routing core over a three-tier Walker constellation:
//! positions from circular orbits, dynamic cluster membership, seeded
//! random traffic with TTL expiry, and a JSON run report.
//!
//! # Tick order
//!
//! ```text
//! clock -> positions -> clustering -> deliveries -> expiry -> traffic -> engine.step
//! ```

use constellation_routing::RoutingError;
use orbital_mechanics::OrbitalError;
use thiserror::Error;

pub mod clustering;
pub mod loader;
pub mod report;
pub mod runner;
pub mod scenario;

pub use clustering::{Clustering, Constellation, SatNode};
pub use report::RunReport;
pub use runner::Simulation;
pub use scenario::{Scenario, TrafficModel};

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("Orbital error: {0}")]
    Orbital(#[from] OrbitalError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;
