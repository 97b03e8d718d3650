//! Constellation Routing Simulator CLI
//!
//! Usage:
//!   constellation-sim --scenario data/scenarios/three_tier.json \
//!                     --output run_report.json

use anyhow::Result;
use clap::Parser;
use constellation_sim::{loader, Simulation};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "constellation-sim",
    about = "Run multi-tier contact-graph routing over a Walker constellation"
)]
struct Args {
    /// Path to scenario JSON file
    #[arg(short, long, default_value = "data/scenarios/three_tier.json")]
    scenario: PathBuf,

    /// Output run report JSON file
    #[arg(short, long, default_value = "run_report.json")]
    output: PathBuf,

    /// Override the scenario tick count
    #[arg(long)]
    ticks: Option<u64>,

    /// Override the routing RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Candidate-scan worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{}", "=".repeat(60));
    info!("Constellation Routing Simulator");
    info!("{}", "=".repeat(60));

    let mut scenario = loader::load_scenario(&args.scenario)?;
    if let Some(ticks) = args.ticks {
        scenario.ticks = ticks;
    }
    if let Some(seed) = args.seed {
        scenario.routing.rng_seed = seed;
    }
    if let Some(workers) = args.workers {
        scenario.routing.workers = workers;
    }

    let mut sim = Simulation::new(scenario)?;
    let report = sim.run()?;
    report.write(&args.output)?;

    info!("\n{}", "=".repeat(60));
    info!("SUMMARY");
    info!("{}", "=".repeat(60));
    info!("Messages created:   {}", report.created);
    info!(
        "Delivered:          {} ({:.1}%)",
        report.delivered,
        report.delivery_ratio() * 100.0
    );
    info!("Expired:            {}", report.expired);
    info!("Still queued:       {}", report.still_queued);
    info!("Links formed/torn:  {}/{}", report.links_formed, report.links_torn);
    if let Some(latency) = report.mean_latency_s {
        info!("Mean latency:       {:.2}s", latency);
    }
    if let Some(hops) = report.mean_hop_count {
        info!("Mean hop count:     {:.2}", hops);
    }

    Ok(())
}
