//! Scenario definition read from JSON

use crate::{Result, SimError};
use constellation_routing::{RoutingConfig, SimTime, Tier};
use orbital_mechanics::WalkerShell;
use serde::{Deserialize, Serialize};

/// Seeded random message generation between low-tier endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficModel {
    /// Messages created per tick
    pub messages_per_tick: u32,
    /// Smallest message (bytes)
    pub min_size: u64,
    /// Largest message (bytes)
    pub max_size: u64,
    /// Message time to live (s)
    pub ttl: SimTime,
    /// Stop generating after this tick; `None` keeps going
    pub until_tick: Option<u64>,
    pub seed: u64,
}

impl Default for TrafficModel {
    fn default() -> Self {
        Self {
            messages_per_tick: 2,
            min_size: 50_000,
            max_size: 2_000_000,
            ttl: 1_800.0,
            until_tick: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub low: WalkerShell,
    pub medium: WalkerShell,
    pub high: WalkerShell,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub traffic: TrafficModel,
    pub ticks: u64,
    /// Seconds of simulated time per tick
    pub tick_length: SimTime,
    /// Allow links between matching slots of adjacent low-tier planes
    #[serde(default = "default_cross_plane")]
    pub cross_plane_links: bool,
}

fn default_cross_plane() -> bool {
    true
}

impl Scenario {
    pub fn shell(&self, tier: Tier) -> &WalkerShell {
        match tier {
            Tier::Low => &self.low,
            Tier::Medium => &self.medium,
            Tier::High => &self.high,
        }
    }

    pub fn node_count(&self) -> usize {
        Tier::ALL.iter().map(|&t| self.shell(t).total()).sum()
    }

    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            self.shell(tier).validate()?;
        }
        self.routing.validate()?;
        if self.ticks == 0 {
            return Err(SimError::InvalidScenario("ticks must be positive".into()));
        }
        if !(self.tick_length > 0.0 && self.tick_length.is_finite()) {
            return Err(SimError::InvalidScenario(format!(
                "tick_length must be positive, got {}",
                self.tick_length
            )));
        }
        let traffic = &self.traffic;
        if traffic.min_size == 0 || traffic.min_size > traffic.max_size {
            return Err(SimError::InvalidScenario(format!(
                "message size bounds {}..={} are empty",
                traffic.min_size, traffic.max_size
            )));
        }
        if traffic.ttl <= 0.0 {
            return Err(SimError::InvalidScenario("traffic ttl must be positive".into()));
        }
        if traffic.messages_per_tick > 0 && self.low.total() < 2 {
            return Err(SimError::InvalidScenario(
                "traffic needs at least two low-tier nodes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_scenario() -> Scenario {
        Scenario {
            name: "test".into(),
            low: WalkerShell::new(2, 4, 1, 550.0, 53.0),
            medium: WalkerShell::new(1, 3, 0, 10_500.0, 55.0),
            high: WalkerShell::geostationary(2),
            routing: RoutingConfig::default(),
            traffic: TrafficModel::default(),
            ticks: 5,
            tick_length: 10.0,
            cross_plane_links: true,
        }
    }

    #[test]
    fn test_valid_scenario() {
        let scenario = create_test_scenario();
        assert!(scenario.validate().is_ok());
        assert_eq!(scenario.node_count(), 8 + 3 + 2);
    }

    #[test]
    fn test_rejects_empty_size_range() {
        let mut scenario = create_test_scenario();
        scenario.traffic.min_size = 10;
        scenario.traffic.max_size = 5;
        assert!(matches!(scenario.validate(), Err(SimError::InvalidScenario(_))));
    }

    #[test]
    fn test_rejects_bad_routing_config() {
        let mut scenario = create_test_scenario();
        scenario.routing.hold_factor = 0.5;
        assert!(matches!(scenario.validate(), Err(SimError::Routing(_))));
    }

    #[test]
    fn test_rejects_zero_ticks() {
        let mut scenario = create_test_scenario();
        scenario.ticks = 0;
        assert!(scenario.validate().is_err());
    }
}
