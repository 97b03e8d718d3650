//! Tick loop driving the routing engine

use crate::clustering::{Clustering, Constellation};
use crate::report::{RunReport, RunStats};
use crate::scenario::Scenario;
use crate::Result;
use chrono::Utc;
use constellation_routing::collaborators::in_memory::{
    AcceptAll, ClusterMap, FixedClock, OutgoingQueues, PositionTable,
};
use constellation_routing::{
    Clock, Environment, Message, MessageId, NodeAddress, RoutingEngine, SimTime, Tick, TickReport,
    Tier,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, info};

pub struct Simulation {
    scenario: Scenario,
    constellation: Constellation,
    clustering: Clustering,
    engine: RoutingEngine,
    clock: FixedClock,
    positions: PositionTable,
    buffer: OutgoingQueues,
    transport: AcceptAll,
    /// Low-tier traffic endpoints
    endpoints: Vec<NodeAddress>,
    traffic_rng: StdRng,
    /// Hops taken so far per message
    hops: HashMap<MessageId, usize>,
    stats: RunStats,
    next_message: u64,
    last_tick: Tick,
}

impl Simulation {
    pub fn new(scenario: Scenario) -> Result<Self> {
        scenario.validate()?;
        let constellation = Constellation::from_scenario(&scenario)?;
        let clustering = Clustering::build(&constellation, &scenario.routing, scenario.cross_plane_links);
        let mut engine = RoutingEngine::new(scenario.routing.clone())?;
        for node in constellation.nodes() {
            engine.add_node(node.address, node.tier);
        }

        info!(
            scenario = %scenario.name,
            low = scenario.low.total(),
            medium = scenario.medium.total(),
            high = scenario.high.total(),
            ticks = scenario.ticks,
            "simulation ready"
        );

        Ok(Self {
            endpoints: constellation.addresses(Tier::Low),
            traffic_rng: StdRng::seed_from_u64(scenario.traffic.seed),
            positions: constellation.positions_at(0.0),
            clock: FixedClock::new(0.0),
            buffer: OutgoingQueues::new(),
            transport: AcceptAll,
            hops: HashMap::new(),
            stats: RunStats::default(),
            next_message: 0,
            last_tick: 0,
            scenario,
            constellation,
            clustering,
            engine,
        })
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    pub fn buffer(&self) -> &OutgoingQueues {
        &self.buffer
    }

    pub fn directory(&self) -> &ClusterMap {
        self.clustering.directory()
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Run every remaining tick and summarize
    pub fn run(&mut self) -> Result<RunReport> {
        for tick in self.last_tick + 1..=self.scenario.ticks {
            self.tick(tick)?;
        }
        Ok(self.report())
    }

    pub fn tick(&mut self, tick: Tick) -> Result<TickReport> {
        let now = tick as SimTime * self.scenario.tick_length;
        self.clock.set(now);
        self.positions = self.constellation.positions_at(now);
        self.stats.manager_changes += self.clustering.reassign(&self.constellation, &self.positions);

        self.deliver(now);
        self.expire(now);
        self.generate(tick, now);

        let env = Environment::new(&self.clock, &self.positions, self.clustering.directory());
        let report = self
            .engine
            .step(tick, &env, &mut self.buffer, &mut self.transport)?;
        self.stats.record_tick(&report);
        self.last_tick = tick;

        info!(
            tick,
            now,
            links = self.engine.links().link_count(),
            formed = report.links_formed,
            torn = report.links_torn,
            forwarded = report.forwarded,
            queued = self.buffer.total(),
            delivered = self.stats.delivered,
            "tick"
        );
        Ok(report)
    }

    fn deliver(&mut self, now: SimTime) {
        for delivery in self.engine.complete_transfers(now) {
            let hops = self.hops.entry(delivery.message.id.clone()).or_insert(0);
            *hops += 1;
            let hops = *hops;

            if delivery.to == delivery.message.destination {
                self.hops.remove(&delivery.message.id);
                let latency = delivery.delivered_at - delivery.message.created_at;
                debug!(message = %delivery.message.id, hops, latency, "delivered");
                self.stats.record_delivery(latency, hops);
            } else {
                self.buffer.push(delivery.to, delivery.message);
            }
        }
    }

    fn expire(&mut self, now: SimTime) {
        let expired = self
            .buffer
            .drain_where(|m| m.expires_at().is_some_and(|at| at <= now));
        for message in &expired {
            debug!(message = %message.id, "expired");
            self.hops.remove(&message.id);
        }
        self.stats.expired += expired.len();
    }

    fn generate(&mut self, tick: Tick, now: SimTime) {
        let traffic = &self.scenario.traffic;
        if traffic.until_tick.is_some_and(|last| tick > last) || self.endpoints.len() < 2 {
            return;
        }
        for _ in 0..traffic.messages_per_tick {
            let src = self.traffic_rng.gen_range(0..self.endpoints.len());
            // skip over the source so the pair is always distinct
            let mut dst = self.traffic_rng.gen_range(0..self.endpoints.len() - 1);
            if dst >= src {
                dst += 1;
            }
            let size = self.traffic_rng.gen_range(traffic.min_size..=traffic.max_size);
            self.next_message += 1;

            let message = Message::new(
                format!("m{}", self.next_message),
                self.endpoints[src],
                self.endpoints[dst],
                size,
                now,
            )
            .with_ttl(traffic.ttl);
            debug!(message = %message.id, from = %message.origin, to = %message.destination, size, "created");
            self.buffer.push(message.origin, message);
            self.stats.created += 1;
        }
    }

    pub fn report(&self) -> RunReport {
        let in_flight = self
            .engine
            .links()
            .links()
            .filter(|l| l.is_transferring())
            .count();
        RunReport {
            scenario: self.scenario.name.clone(),
            generated_at: Utc::now(),
            ticks: self.last_tick,
            simulated_seconds: self.clock.now(),
            nodes: self.constellation.len(),
            created: self.stats.created,
            delivered: self.stats.delivered,
            expired: self.stats.expired,
            still_queued: self.buffer.total(),
            in_flight,
            links_formed: self.stats.links_formed,
            links_torn: self.stats.links_torn,
            forwarded: self.stats.forwarded,
            deferred: self.stats.deferred,
            unroutable: self.stats.unroutable,
            returned: self.stats.returned,
            index_repairs: self.stats.repairs,
            manager_changes: self.stats.manager_changes,
            mean_latency_s: self.stats.mean_latency(),
            mean_hop_count: self.stats.mean_hop_count(),
        }
    }
}
