//! Generators for constellation routing property tests
//!
//! Values are plain primitives (seconds, bytes, bytes/s, km, node indices)
//! so the harness stays independent of the crates it exercises.

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;

/// Undirected edge: (node, node, speed in bytes/s)
pub type EdgeSpec = (u32, u32, u64);

// ============================================================================
// Time Generators (seconds)
// ============================================================================

/// Simulated time within one day
pub fn sim_time() -> impl Strategy<Value = f64> {
    0.0f64..86_400.0
}

/// Tick length (0.1s to 60s)
pub fn tick_length() -> impl Strategy<Value = f64> {
    0.1f64..=60.0
}

/// Message time-to-live (1 minute to 6 hours)
pub fn ttl() -> impl Strategy<Value = f64> {
    60.0f64..=21_600.0
}

/// Contact window as (start, end) with end after start
pub fn contact_window() -> impl Strategy<Value = (f64, f64)> {
    (sim_time(), 1.0f64..=3_600.0).prop_map(|(start, len)| (start, start + len))
}

// ============================================================================
// Traffic / Link Generators
// ============================================================================

/// Message size in bytes (1 B to 5 MB)
pub fn message_size() -> impl Strategy<Value = u64> {
    1u64..=5_000_000
}

/// Message size below the default laser threshold
pub fn radio_message_size() -> impl Strategy<Value = u64> {
    1u64..=1_000_000
}

/// Link speed in bytes/s (1 kB/s to 2 MB/s)
pub fn link_speed() -> impl Strategy<Value = u64> {
    1_000u64..=2_000_000
}

/// Transmit range in km
pub fn transmit_range_km() -> impl Strategy<Value = f64> {
    100.0f64..=80_000.0
}

// ============================================================================
// Orbital Domain Generators (km, degrees)
// ============================================================================

/// Low-orbit altitude (300-2000 km)
pub fn altitude_low() -> impl Strategy<Value = f64> {
    300.0f64..=2_000.0
}

/// Medium-orbit altitude (2000-35786 km)
pub fn altitude_medium() -> impl Strategy<Value = f64> {
    2_000.0f64..=35_786.0
}

/// Geostationary altitude band
pub fn altitude_high() -> impl Strategy<Value = f64> {
    35_700.0f64..=35_900.0
}

/// Inclination in degrees (0-180)
pub fn inclination_deg() -> impl Strategy<Value = f64> {
    0.0f64..=180.0
}

/// RAAN / phase angle in degrees (0-360)
pub fn angle_deg() -> impl Strategy<Value = f64> {
    0.0f64..360.0
}

/// Walker shell as (planes, per_plane, altitude km, inclination deg)
pub fn walker_shell() -> impl Strategy<Value = (u16, u16, f64, f64)> {
    (1u16..=8, 1u16..=12, altitude_low(), inclination_deg())
}

// ============================================================================
// Routing Parameter Generators
// ============================================================================

/// Link hold multiplier
pub fn hold_factor() -> impl Strategy<Value = f64> {
    1.0f64..=10.0
}

/// RNG seed
pub fn seed() -> impl Strategy<Value = u64> {
    any::<u64>()
}

// ============================================================================
// Topology Generators (nodes numbered from 1)
// ============================================================================

/// Linear chain 1 - 2 - ... - n with per-edge speeds
pub fn chain_edges(max_nodes: u32) -> impl Strategy<Value = (u32, Vec<EdgeSpec>)> {
    (2u32..=max_nodes.max(2)).prop_flat_map(|n| {
        vec(link_speed(), (n - 1) as usize).prop_map(move |speeds| {
            let edges = speeds
                .into_iter()
                .enumerate()
                .map(|(i, s)| (i as u32 + 1, i as u32 + 2, s))
                .collect();
            (n, edges)
        })
    })
}

/// Closed ring of n >= 3 nodes, uniform speed
pub fn ring_edges(max_nodes: u32) -> impl Strategy<Value = (u32, Vec<EdgeSpec>)> {
    (3u32..=max_nodes.max(3), link_speed()).prop_map(|(n, speed)| {
        let edges = (1..=n).map(|i| (i, i % n + 1, speed)).collect();
        (n, edges)
    })
}

/// Sparse random graph; node 1 is always present, self loops never appear
pub fn random_graph(max_nodes: u32, max_edges: usize) -> impl Strategy<Value = (u32, Vec<EdgeSpec>)> {
    (2u32..=max_nodes.max(2)).prop_flat_map(move |n| {
        let edge = (1..=n, 1..=n, link_speed());
        btree_set(edge, 1..=max_edges.max(1)).prop_map(move |set| {
            let edges = set.into_iter().filter(|(a, b, _)| a != b).collect();
            (n, edges)
        })
    })
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Seconds to push `size` bytes at `speed` bytes/s
pub fn transfer_seconds(size: u64, speed: u64) -> f64 {
    if speed == 0 {
        return f64::INFINITY;
    }
    size as f64 / speed as f64
}
