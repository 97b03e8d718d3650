//! Run report written at the end of a simulation

use crate::Result;
use chrono::{DateTime, Utc};
use constellation_routing::{SimTime, TickReport};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

/// Counters accumulated while the tick loop runs
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub created: usize,
    pub delivered: usize,
    pub expired: usize,
    pub links_formed: usize,
    pub links_torn: usize,
    pub forwarded: usize,
    pub deferred: usize,
    pub unroutable: usize,
    pub returned: usize,
    pub repairs: usize,
    pub manager_changes: usize,
    latency_total: SimTime,
    hops_total: usize,
}

impl RunStats {
    pub fn record_tick(&mut self, report: &TickReport) {
        self.links_formed += report.links_formed;
        self.links_torn += report.links_torn;
        self.forwarded += report.forwarded;
        self.deferred += report.deferred;
        self.unroutable += report.unroutable;
        self.returned += report.returned.len();
        if report.repaired {
            self.repairs += 1;
        }
    }

    pub fn record_delivery(&mut self, latency: SimTime, hops: usize) {
        self.delivered += 1;
        self.latency_total += latency;
        self.hops_total += hops;
    }

    pub fn mean_latency(&self) -> Option<SimTime> {
        (self.delivered > 0).then(|| self.latency_total / self.delivered as f64)
    }

    pub fn mean_hop_count(&self) -> Option<f64> {
        (self.delivered > 0).then(|| self.hops_total as f64 / self.delivered as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub generated_at: DateTime<Utc>,
    pub ticks: u64,
    pub simulated_seconds: SimTime,
    pub nodes: usize,
    pub created: usize,
    pub delivered: usize,
    pub expired: usize,
    pub still_queued: usize,
    pub in_flight: usize,
    pub links_formed: usize,
    pub links_torn: usize,
    pub forwarded: usize,
    pub deferred: usize,
    pub unroutable: usize,
    /// In-flight messages handed back by link teardown
    pub returned: usize,
    pub index_repairs: usize,
    pub manager_changes: usize,
    pub mean_latency_s: Option<SimTime>,
    pub mean_hop_count: Option<f64>,
}

impl RunReport {
    pub fn delivery_ratio(&self) -> f64 {
        if self.created == 0 {
            return 0.0;
        }
        self.delivered as f64 / self.created as f64
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Writing run report to {:?}", path);
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
