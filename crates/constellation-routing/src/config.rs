//! Immutable routing configuration
//!
//! Loaded once, validated, then shared by every component as
//! `Arc<RoutingConfig>`.

use crate::types::{Medium, SimTime, Tier};
use crate::{Result, RoutingError};
use serde::{Deserialize, Serialize};

/// Which peers a node may link to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityMode {
    /// Any in-range peer on the same medium
    AllConnected,
    /// Role-gated by cluster membership
    Cluster,
}

/// Adjacency source for the earliest-arrival search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    /// Tier-scoped snapshots over currently-live links
    LiveTopology,
    /// Known and predicted contacts swept forward up to the TTL
    ContactPlan,
}

/// Interface capabilities for one tier on one medium
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterfaceProfile {
    pub tier: Tier,
    pub medium: Medium,
    /// Transmit range (km)
    pub range: f64,
    /// Transmit speed (bytes/s)
    pub speed: u64,
}

impl InterfaceProfile {
    pub fn new(tier: Tier, medium: Medium, range: f64, speed: u64) -> Self {
        Self {
            tier,
            medium,
            range,
            speed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub mode: ConnectivityMode,
    pub search_mode: SearchMode,
    pub interfaces: Vec<InterfaceProfile>,
    /// Multiplier letting a link outlive a single transfer
    pub hold_factor: f64,
    /// Size (bytes) used for the initial hold estimate of a new link
    pub nominal_message_size: u64,
    /// Messages larger than this (bytes) go over laser
    pub message_size_threshold: u64,
    /// Write computed paths into messages
    pub embed_path: bool,
    /// Recomputations allowed after a busy next hop
    pub retry_cap: u32,
    /// Sweep step for contact-plan search (s)
    pub contact_sweep_step: SimTime,
    /// Horizon for messages without a TTL (s)
    pub default_ttl: SimTime,
    /// Hand unroutable low-tier traffic to a random manager
    pub relay_fallback: bool,
    pub rng_seed: u64,
    /// Candidate-scan workers; 1 runs sequentially
    pub workers: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: ConnectivityMode::Cluster,
            search_mode: SearchMode::LiveTopology,
            interfaces: vec![
                InterfaceProfile::new(Tier::Low, Medium::Radio, 3_000.0, 250_000),
                InterfaceProfile::new(Tier::Low, Medium::Laser, 5_000.0, 1_250_000),
                InterfaceProfile::new(Tier::Medium, Medium::Radio, 20_000.0, 250_000),
                InterfaceProfile::new(Tier::Medium, Medium::Laser, 30_000.0, 1_250_000),
                InterfaceProfile::new(Tier::High, Medium::Radio, 60_000.0, 250_000),
                InterfaceProfile::new(Tier::High, Medium::Laser, 80_000.0, 1_250_000),
            ],
            hold_factor: 3.0,
            nominal_message_size: 500_000,
            message_size_threshold: 1_000_000,
            embed_path: true,
            retry_cap: 3,
            contact_sweep_step: 1.0,
            default_ttl: 3_600.0,
            relay_fallback: false,
            rng_seed: 9050,
            workers: 1,
        }
    }
}

impl RoutingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: ConnectivityMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_search_mode(mut self, search_mode: SearchMode) -> Self {
        self.search_mode = search_mode;
        self
    }

    /// Replace every profile with `range`/`speed` for all tiers on `medium`
    pub fn with_uniform_interfaces(mut self, medium: Medium, range: f64, speed: u64) -> Self {
        self.interfaces = Tier::ALL
            .iter()
            .map(|&tier| InterfaceProfile::new(tier, medium, range, speed))
            .collect();
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<InterfaceProfile>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_hold_factor(mut self, hold_factor: f64) -> Self {
        self.hold_factor = hold_factor;
        self
    }

    pub fn with_message_size_threshold(mut self, threshold: u64) -> Self {
        self.message_size_threshold = threshold;
        self
    }

    pub fn with_embed_path(mut self, embed_path: bool) -> Self {
        self.embed_path = embed_path;
        self
    }

    pub fn with_retry_cap(mut self, retry_cap: u32) -> Self {
        self.retry_cap = retry_cap;
        self
    }

    pub fn with_relay_fallback(mut self, relay_fallback: bool) -> Self {
        self.relay_fallback = relay_fallback;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Profiles configured for a tier
    pub fn profiles_for(&self, tier: Tier) -> impl Iterator<Item = &InterfaceProfile> {
        self.interfaces.iter().filter(move |p| p.tier == tier)
    }

    pub fn profile(&self, tier: Tier, medium: Medium) -> Option<&InterfaceProfile> {
        self.interfaces
            .iter()
            .find(|p| p.tier == tier && p.medium == medium)
    }

    pub fn medium_for(&self, size: u64) -> Medium {
        Medium::for_size(size, self.message_size_threshold)
    }

    /// Predicted disconnect time for a link carrying `size` bytes
    pub fn hold_until(&self, now: SimTime, size: u64, speed: u64) -> SimTime {
        now + self.hold_factor * transmit_time(size, speed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(RoutingError::InvalidConfig(
                "at least one interface profile is required".into(),
            ));
        }
        for p in &self.interfaces {
            if !(p.range.is_finite() && p.range > 0.0) {
                return Err(RoutingError::InvalidConfig(format!(
                    "{} {:?} range must be positive, got {}",
                    p.tier, p.medium, p.range
                )));
            }
            if p.speed == 0 {
                return Err(RoutingError::InvalidConfig(format!(
                    "{} {:?} speed must be positive",
                    p.tier, p.medium
                )));
            }
            let dupes = self
                .interfaces
                .iter()
                .filter(|q| q.tier == p.tier && q.medium == p.medium)
                .count();
            if dupes > 1 {
                return Err(RoutingError::InvalidConfig(format!(
                    "duplicate {} {:?} profile",
                    p.tier, p.medium
                )));
            }
        }
        if !(self.hold_factor.is_finite() && self.hold_factor >= 1.0) {
            return Err(RoutingError::InvalidConfig(format!(
                "hold_factor must be >= 1.0, got {}",
                self.hold_factor
            )));
        }
        if !(self.contact_sweep_step > 0.0) || !(self.default_ttl > 0.0) {
            return Err(RoutingError::InvalidConfig(
                "contact_sweep_step and default_ttl must be positive".into(),
            ));
        }
        if self.workers == 0 {
            return Err(RoutingError::InvalidConfig("workers must be >= 1".into()));
        }
        Ok(())
    }
}

/// Seconds needed to push `size` bytes at `speed` bytes/s
pub fn transmit_time(size: u64, speed: u64) -> SimTime {
    if speed == 0 {
        return SimTime::INFINITY;
    }
    size as f64 / speed as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RoutingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.profiles_for(Tier::Medium).count(), 2);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = RoutingConfig::default();
        config.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(RoutingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_profiles() {
        let mut config = RoutingConfig::default()
            .with_uniform_interfaces(Medium::Radio, 100.0, 10);
        config
            .interfaces
            .push(InterfaceProfile::new(Tier::Low, Medium::Radio, 50.0, 10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hold_until_scales_with_size() {
        let config = RoutingConfig::default().with_hold_factor(2.0);
        assert_eq!(config.hold_until(10.0, 1_000, 100), 30.0);
        assert_eq!(config.hold_until(10.0, 2_000, 100), 50.0);
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let json = r#"{ "mode": "AllConnected", "embed_path": false }"#;
        let config: RoutingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, ConnectivityMode::AllConnected);
        assert!(!config.embed_path);
        assert_eq!(config.retry_cap, 3);
    }
}
