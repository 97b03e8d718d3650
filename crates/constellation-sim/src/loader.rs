//! Scenario loading from JSON files

use crate::scenario::Scenario;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

/// Read and validate a scenario; any failure is a startup error
pub fn load_scenario(path: impl AsRef<Path>) -> Result<Scenario> {
    let path = path.as_ref();
    info!("Loading scenario from {:?}", path);

    let file = File::open(path).with_context(|| format!("cannot open scenario {:?}", path))?;
    let reader = BufReader::new(file);
    let scenario: Scenario = serde_json::from_reader(reader)
        .with_context(|| format!("malformed scenario {:?}", path))?;
    scenario
        .validate()
        .with_context(|| format!("invalid scenario {:?}", path))?;

    info!(
        "Loaded scenario '{}' ({} nodes, {} ticks of {}s)",
        scenario.name,
        scenario.node_count(),
        scenario.ticks,
        scenario.tick_length
    );
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use constellation_routing::{ConnectivityMode, SearchMode};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"{
        "name": "minimal",
        "low": {"planes": 2, "per_plane": 4, "phasing": 1, "altitude_km": 550.0, "inclination_deg": 53.0},
        "medium": {"planes": 1, "per_plane": 3, "altitude_km": 10500.0, "inclination_deg": 55.0},
        "high": {"planes": 1, "per_plane": 2, "altitude_km": 35786.0, "inclination_deg": 0.0},
        "ticks": 10,
        "tick_length": 5.0
    }"#;

    fn write_temp(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_scenario_uses_defaults() {
        let file = write_temp(MINIMAL);
        let scenario = load_scenario(file.path()).unwrap();

        assert_eq!(scenario.name, "minimal");
        assert_eq!(scenario.node_count(), 13);
        assert_eq!(scenario.medium.phasing, 0);
        assert!(scenario.cross_plane_links);
        assert_eq!(scenario.routing.mode, ConnectivityMode::Cluster);
        assert_eq!(scenario.traffic.messages_per_tick, 2);
    }

    #[test]
    fn test_load_routing_overrides() {
        let json = MINIMAL.replacen(
            "\"ticks\": 10,",
            r#""ticks": 10,
            "routing": {"search_mode": "ContactPlan", "relay_fallback": true, "workers": 4},
            "traffic": {"messages_per_tick": 5, "seed": 7},"#,
            1,
        );
        let file = write_temp(&json);
        let scenario = load_scenario(file.path()).unwrap();

        assert_eq!(scenario.routing.search_mode, SearchMode::ContactPlan);
        assert!(scenario.routing.relay_fallback);
        assert_eq!(scenario.routing.workers, 4);
        assert_eq!(scenario.routing.retry_cap, 3);
        assert_eq!(scenario.traffic.messages_per_tick, 5);
        assert_eq!(scenario.traffic.seed, 7);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_scenario("/nonexistent/scenario.json").unwrap_err();
        assert!(err.to_string().contains("cannot open scenario"));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let json = MINIMAL.replacen(
            "\"ticks\": 10,",
            r#""ticks": 10, "routing": {"workers": 0},"#,
            1,
        );
        let file = write_temp(&json);
        let err = load_scenario(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid scenario"));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let file = write_temp("{ not json");
        assert!(load_scenario(file.path()).is_err());
    }

    #[test]
    fn test_bundled_scenario_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../data/scenarios/three_tier.json");
        let scenario = load_scenario(path).unwrap();
        assert_eq!(scenario.node_count(), 60 + 18 + 3);
        assert_eq!(scenario.routing.interfaces.len(), 6);
    }
}
