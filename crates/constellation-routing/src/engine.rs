//! Per-tick routing driver
//!
//! Composes the link manager, contact schedule, tier views, search and
//! forwarder. Every node goes through the same pass each tick:
//!
//! 1. Teardown of links whose endpoints moved out of range
//! 2. Formation of new in-range, role-permitted links
//! 3. Release of idle links whose hold elapsed
//! 4. One forwarding decision per queued message
//!
//! [`RoutingEngine::step`] runs phases 1 and 2 for all nodes before any
//! node forwards, so the candidate scan can be spread over worker threads
//! and merged in address order without changing the outcome.

use crate::collaborators::{ClusterDirectory, Environment, MessageBuffer, TransferStart, Transport};
use crate::config::{ConnectivityMode, RoutingConfig, SearchMode};
use crate::contact::{ContactGraph, ContactSchedule};
use crate::forwarding::{Forwarder, ForwardingContext, ForwardingOutcome};
use crate::link::{ConnectOutcome, Delivery, InterfaceId, Link, LinkId, LinkManager};
use crate::search::{CacheKey, EarliestArrivalSearch, RouteCache, RoutingTable, SearchRequest, Seed};
use crate::topology::{ScopeKey, TierViews, ViewContext};
use crate::types::{Hop, HopPath, Medium, Message, MessageId, NodeAddress, SimTime, Tick, Tier};
use crate::{Result, RoutingError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

type CandidatePairs = Vec<(InterfaceId, InterfaceId)>;

/// What one node did during a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub node: NodeAddress,
    pub torn_down: usize,
    pub connected: usize,
    /// Idle links released after their hold elapsed
    pub released: usize,
    /// In-flight messages handed back by teardown
    pub returned: Vec<MessageId>,
    pub forwarded: usize,
    pub deferred: usize,
    pub unroutable: usize,
    /// Offers declined by the transport
    pub rejected: usize,
    /// Forwarding pass skipped (isolated node)
    pub skipped: bool,
    /// Link index was inconsistent and rebuilt
    pub repaired: bool,
}

impl NodeReport {
    pub fn new(node: NodeAddress) -> Self {
        Self {
            node,
            torn_down: 0,
            connected: 0,
            released: 0,
            returned: Vec::new(),
            forwarded: 0,
            deferred: 0,
            unroutable: 0,
            rejected: 0,
            skipped: false,
            repaired: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub tick: Tick,
    pub repaired: bool,
    pub links_formed: usize,
    pub links_torn: usize,
    pub forwarded: usize,
    pub deferred: usize,
    pub unroutable: usize,
    pub returned: Vec<MessageId>,
    pub nodes: Vec<NodeReport>,
}

impl TickReport {
    fn from_nodes(tick: Tick, repaired: bool, nodes: Vec<NodeReport>) -> Self {
        Self {
            tick,
            repaired,
            links_formed: nodes.iter().map(|n| n.connected).sum(),
            links_torn: nodes.iter().map(|n| n.torn_down + n.released).sum(),
            forwarded: nodes.iter().map(|n| n.forwarded).sum(),
            deferred: nodes.iter().map(|n| n.deferred).sum(),
            unroutable: nodes.iter().map(|n| n.unroutable).sum(),
            returned: nodes.iter().flat_map(|n| n.returned.iter().cloned()).collect(),
            nodes,
        }
    }
}

pub struct RoutingEngine {
    config: Arc<RoutingConfig>,
    links: LinkManager,
    schedule: ContactSchedule,
    views: TierViews,
    search: EarliestArrivalSearch,
    forwarder: Forwarder,
    caches: HashMap<NodeAddress, RouteCache>,
    tick: Tick,
}

impl RoutingEngine {
    /// Validate the configuration and build an engine with no nodes
    pub fn new(config: RoutingConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(
            mode = ?config.mode,
            search_mode = ?config.search_mode,
            workers = config.workers,
            "routing engine initialized"
        );
        Ok(Self {
            links: LinkManager::new(config.clone()),
            schedule: ContactSchedule::new(config.clone()),
            views: TierViews::new(),
            search: EarliestArrivalSearch::new(),
            forwarder: Forwarder::new(config.embed_path, config.retry_cap),
            caches: HashMap::new(),
            tick: 0,
            config,
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut LinkManager {
        &mut self.links
    }

    pub fn schedule(&self) -> &ContactSchedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut ContactSchedule {
        &mut self.schedule
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Cache (hits, misses) for a node
    pub fn cache_stats(&self, node: NodeAddress) -> Option<(u64, u64)> {
        self.caches.get(&node).map(|c| c.stats())
    }

    pub fn add_node(&mut self, node: NodeAddress, tier: Tier) -> Vec<InterfaceId> {
        self.caches.entry(node).or_default();
        self.links.register_node(node, tier)
    }

    /// Drop cached tables at both endpoints of a changed link
    pub fn on_link_changed(&mut self, link: &Link) {
        let (a, b) = link.endpoints();
        self.invalidate_pair(a, b);
    }

    fn invalidate_pair(&mut self, a: NodeAddress, b: NodeAddress) {
        for node in [a, b] {
            if let Some(cache) = self.caches.get_mut(&node) {
                cache.invalidate();
            }
        }
    }

    /// Run the full per-tick pass for a single node
    pub fn update(
        &mut self,
        node: NodeAddress,
        tick: Tick,
        env: &Environment<'_>,
        buffer: &mut dyn MessageBuffer,
        transport: &mut dyn Transport,
    ) -> Result<NodeReport> {
        if !self.links.is_registered(node) {
            return Err(RoutingError::UnknownNode(node));
        }
        self.tick = tick;
        let mut report = NodeReport::new(node);
        report.repaired = self.ensure_consistent();

        self.teardown(node, env, buffer, &mut report)?;
        let pairs = self.links.candidates(node, env);
        self.connect(&pairs, env, &mut report);
        self.release_idle(node, env.now(), buffer, &mut report)?;
        self.forward(node, env, buffer, transport, &mut report)?;
        Ok(report)
    }

    /// Advance every registered node by one tick, in address order
    pub fn step(
        &mut self,
        tick: Tick,
        env: &Environment<'_>,
        buffer: &mut dyn MessageBuffer,
        transport: &mut dyn Transport,
    ) -> Result<TickReport> {
        self.tick = tick;
        let repaired = self.ensure_consistent();
        let nodes: Vec<NodeAddress> = self.links.nodes().collect();
        let mut reports: BTreeMap<NodeAddress, NodeReport> =
            nodes.iter().map(|&n| (n, NodeReport::new(n))).collect();

        for (&node, report) in reports.iter_mut() {
            self.teardown(node, env, buffer, report)?;
        }
        for (node, pairs) in self.scan_candidates(&nodes, env) {
            if let Some(report) = reports.get_mut(&node) {
                self.connect(&pairs, env, report);
            }
        }
        let now = env.now();
        for (&node, report) in reports.iter_mut() {
            self.release_idle(node, now, buffer, report)?;
            self.forward(node, env, buffer, transport, report)?;
        }

        let report = TickReport::from_nodes(tick, repaired, reports.into_values().collect());
        debug!(
            tick,
            formed = report.links_formed,
            torn = report.links_torn,
            forwarded = report.forwarded,
            deferred = report.deferred,
            unroutable = report.unroutable,
            "tick complete"
        );
        Ok(report)
    }

    /// Finish transfers due by `now`
    pub fn complete_transfers(&mut self, now: SimTime) -> Vec<Delivery> {
        self.links.complete_due(now)
    }

    /// Next hop the node would pick for the message. Leaves the message
    /// and the link table untouched.
    pub fn next_hop(
        &mut self,
        node: NodeAddress,
        message: &Message,
        env: &Environment<'_>,
    ) -> Option<NodeAddress> {
        if self.config.embed_path {
            if let Some(hop) = message.embedded_next_hop(node) {
                if self.hop_reachable(node, hop, message, env) {
                    return Some(hop.address);
                }
            }
        }
        let mut routes = Routes {
            config: self.config.as_ref(),
            views: &self.views,
            search: &self.search,
            caches: &mut self.caches,
            tick: self.tick,
        };
        routes
            .path(&self.links, &self.schedule, env, node, message, &BTreeSet::new(), 0)
            .and_then(|path| path.first().map(|h| h.address))
    }

    /// Embedded path names a next hop after `node` that is live,
    /// realizable or flagged may-wait
    pub fn is_path_still_valid(&self, node: NodeAddress, message: &Message, env: &Environment<'_>) -> bool {
        message
            .embedded_next_hop(node)
            .is_some_and(|hop| self.hop_reachable(node, hop, message, env))
    }

    /// Routing table for one scope, served from the node's cache when
    /// already computed this tick
    pub fn table_for(
        &mut self,
        node: NodeAddress,
        scope: ScopeKey,
        size: u64,
        env: &Environment<'_>,
    ) -> Arc<RoutingTable> {
        let medium = self.config.medium_for(size);
        let mut routes = Routes {
            config: self.config.as_ref(),
            views: &self.views,
            search: &self.search,
            caches: &mut self.caches,
            tick: self.tick,
        };
        routes.table(&self.links, &self.schedule, env, node, scope, size, medium, &BTreeSet::new(), 0)
    }

    fn hop_reachable(&self, node: NodeAddress, hop: Hop, message: &Message, env: &Environment<'_>) -> bool {
        let medium = self.config.medium_for(message.size);
        hop.may_wait
            || self.links.link_between(node, hop.address, Some(medium)).is_some()
            || self
                .links
                .check_pairing(InterfaceId::new(node, medium), InterfaceId::new(hop.address, medium), env)
                .is_ok()
    }

    fn ensure_consistent(&mut self) -> bool {
        match self.links.check_invariants() {
            Ok(()) => false,
            Err(err) => {
                warn!(tick = self.tick, error = %err, "link table inconsistent, rebuilding index and routes");
                self.links.repair_index();
                for cache in self.caches.values_mut() {
                    cache.invalidate();
                }
                true
            }
        }
    }

    fn teardown(
        &mut self,
        node: NodeAddress,
        env: &Environment<'_>,
        buffer: &mut dyn MessageBuffer,
        report: &mut NodeReport,
    ) -> Result<()> {
        let now = env.now();
        let update = self.links.teardown_out_of_range(node, env, buffer)?;
        for link in &update.torn_down {
            let (a, b) = link.endpoints();
            self.schedule.record_down(a, b, now);
            self.on_link_changed(link);
        }
        report.torn_down += update.torn_down.len();
        report.returned.extend(update.returned);
        Ok(())
    }

    fn connect(&mut self, pairs: &[(InterfaceId, InterfaceId)], env: &Environment<'_>, report: &mut NodeReport) {
        let now = env.now();
        for id in self.links.apply_candidates(pairs, env) {
            let Some((a, b, speed)) = self.links.link(id).map(|l| (l.a.node, l.b.node, l.speed)) else {
                continue;
            };
            self.schedule.record_up(a, b, now, speed);
            self.invalidate_pair(a, b);
            report.connected += 1;
        }
    }

    fn release_idle(
        &mut self,
        node: NodeAddress,
        now: SimTime,
        buffer: &mut dyn MessageBuffer,
        report: &mut NodeReport,
    ) -> Result<()> {
        let released = self.schedule.connection_check(node, now, &mut self.links, buffer)?;
        for link in &released {
            self.on_link_changed(link);
        }
        report.released += released.len();
        Ok(())
    }

    /// Candidate pairs per node, computed on worker threads when configured
    fn scan_candidates(&self, nodes: &[NodeAddress], env: &Environment<'_>) -> Vec<(NodeAddress, CandidatePairs)> {
        let workers = self.config.workers.min(nodes.len()).max(1);
        if workers == 1 {
            return nodes.iter().map(|&n| (n, self.links.candidates(n, env))).collect();
        }
        let links = &self.links;
        let chunk = nodes.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .chunks(chunk)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|&n| (n, links.candidates(n, env)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    /// Low-tier node with no manager and no live link has nothing to do
    fn is_isolated(&self, node: NodeAddress, directory: &dyn ClusterDirectory) -> bool {
        self.config.mode == ConnectivityMode::Cluster
            && directory.tier(node) == Some(Tier::Low)
            && directory.managers(node).is_empty()
            && self.links.links_of(node).next().is_none()
    }

    fn forward(
        &mut self,
        node: NodeAddress,
        env: &Environment<'_>,
        buffer: &mut dyn MessageBuffer,
        transport: &mut dyn Transport,
        report: &mut NodeReport,
    ) -> Result<()> {
        if self.is_isolated(node, env.directory) {
            trace!(node = %node, "isolated, skipping forwarding");
            report.skipped = true;
            return Ok(());
        }
        let now = env.now();
        let forwarder = self.forwarder;

        for id in buffer.outgoing(node) {
            if self.links.node_is_transferring(node) {
                break;
            }
            let (decision, realized) = {
                let Some(message) = buffer.message_mut(node, &id) else {
                    continue;
                };
                if message.destination == node || message.is_waiting(now) {
                    continue;
                }
                let mut ctx = NodeContext {
                    node,
                    now,
                    env,
                    links: &mut self.links,
                    schedule: &mut self.schedule,
                    routes: Routes {
                        config: self.config.as_ref(),
                        views: &self.views,
                        search: &self.search,
                        caches: &mut self.caches,
                        tick: self.tick,
                    },
                    realized: 0,
                };
                let decision = forwarder.decide(&mut ctx, message);
                (decision, ctx.realized)
            };
            report.connected += realized;

            match decision.outcome {
                ForwardingOutcome::Forward { next_hop, link, source } => {
                    match self.links.start_transfer(link, node, &id, now, buffer, transport)? {
                        TransferStart::Ok => {
                            debug!(node = %node, message = %id, next_hop = %next_hop, ?source, "forwarded");
                            report.forwarded += 1;
                        }
                        TransferStart::Defer => report.deferred += 1,
                        TransferStart::Reject => {
                            debug!(node = %node, message = %id, next_hop = %next_hop, "transfer rejected");
                            report.rejected += 1;
                        }
                    }
                }
                ForwardingOutcome::Deferred { next_hop, until } => {
                    debug!(node = %node, message = %id, next_hop = %next_hop, until, "deferred");
                    report.deferred += 1;
                }
                ForwardingOutcome::Unroutable => {
                    trace!(node = %node, message = %id, "no path this tick");
                    report.unroutable += 1;
                }
            }
        }
        Ok(())
    }
}

/// Per-call RNG seed so a recomputation within a tick replays exactly
fn search_seed(seed: u64, source: NodeAddress, tick: Tick, attempt: u32) -> u64 {
    let mut x = seed ^ (u64::from(source.0) << 32) ^ u64::from(attempt);
    x ^= tick.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    // splitmix64 finalizer
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Scoped table lookup backed by the per-node caches
struct Routes<'e> {
    config: &'e RoutingConfig,
    views: &'e TierViews,
    search: &'e EarliestArrivalSearch,
    caches: &'e mut HashMap<NodeAddress, RouteCache>,
    tick: Tick,
}

impl Routes<'_> {
    fn invalidate(&mut self, node: NodeAddress) {
        if let Some(cache) = self.caches.get_mut(&node) {
            cache.invalidate();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn table(
        &mut self,
        links: &LinkManager,
        schedule: &ContactSchedule,
        env: &Environment<'_>,
        source: NodeAddress,
        scope: ScopeKey,
        size: u64,
        medium: Medium,
        excluded: &BTreeSet<NodeAddress>,
        attempt: u32,
    ) -> Arc<RoutingTable> {
        let key = CacheKey::new(scope, size, excluded);
        let cache = self.caches.entry(source).or_default();
        cache.begin_tick(self.tick);
        if let Some(table) = cache.get(&key) {
            return table;
        }

        let request = SearchRequest::new(source, env.now(), size).with_excluded(excluded.clone());
        let seeds: Vec<Seed> = links
            .links_of(source)
            .filter(|l| l.medium() == medium)
            .filter_map(|l| {
                l.other(source).map(|neighbor| Seed {
                    neighbor,
                    speed: l.speed,
                })
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(search_seed(self.config.rng_seed, source, self.tick, attempt));
        let table = match key.scope {
            ScopeKey::Contacts { horizon } => {
                let graph = ContactGraph::new(schedule, self.config.contact_sweep_step, horizon as SimTime);
                self.search.run(&request, &graph, &seeds, &mut rng)
            }
            ref scope => {
                let snapshot = ViewContext::new(env.directory, links, self.config, medium).build(scope, source);
                self.search.run(&request, &snapshot, &seeds, &mut rng)
            }
        };
        trace!(source = %source, scope = ?key.scope, reachable = table.len(), "table computed");
        cache.insert(key, table)
    }

    fn scopes(
        &self,
        links: &LinkManager,
        env: &Environment<'_>,
        source: NodeAddress,
        message: &Message,
        medium: Medium,
    ) -> Vec<ScopeKey> {
        match (self.config.search_mode, self.config.mode) {
            (SearchMode::ContactPlan, _) => {
                let horizon = message
                    .expires_at()
                    .unwrap_or(env.now() + self.config.default_ttl);
                vec![ScopeKey::Contacts {
                    horizon: horizon.max(0.0).ceil() as u64,
                }]
            }
            (SearchMode::LiveTopology, ConnectivityMode::AllConnected) => vec![ScopeKey::Live],
            (SearchMode::LiveTopology, ConnectivityMode::Cluster) => {
                let Some(tier) = env.directory.tier(source) else {
                    return Vec::new();
                };
                let ctx = ViewContext::new(env.directory, links, self.config, medium);
                self.views.for_tier(tier).plan(&ctx, source, message.destination)
            }
        }
    }

    /// First scope, narrowest first, whose table reaches the destination
    #[allow(clippy::too_many_arguments)]
    fn path(
        &mut self,
        links: &LinkManager,
        schedule: &ContactSchedule,
        env: &Environment<'_>,
        source: NodeAddress,
        message: &Message,
        excluded: &BTreeSet<NodeAddress>,
        attempt: u32,
    ) -> Option<HopPath> {
        let medium = self.config.medium_for(message.size);
        for scope in self.scopes(links, env, source, message, medium) {
            let table = self.table(links, schedule, env, source, scope, message.size, medium, excluded, attempt);
            if let Some(path) = table.path(message.destination) {
                return Some(path.clone());
            }
        }
        None
    }
}

/// Forwarding context for one node during one tick
struct NodeContext<'e, 'a> {
    node: NodeAddress,
    now: SimTime,
    env: &'e Environment<'a>,
    links: &'e mut LinkManager,
    schedule: &'e mut ContactSchedule,
    routes: Routes<'e>,
    /// Links opened on demand during the decision
    realized: usize,
}

impl ForwardingContext for NodeContext<'_, '_> {
    fn node(&self) -> NodeAddress {
        self.node
    }

    fn now(&self) -> SimTime {
        self.now
    }

    fn route(&mut self, message: &Message, excluded: &BTreeSet<NodeAddress>, attempt: u32) -> Option<HopPath> {
        self.routes
            .path(self.links, self.schedule, self.env, self.node, message, excluded, attempt)
    }

    fn link_to(&mut self, peer: NodeAddress, message: &Message) -> Option<LinkId> {
        let medium = self.routes.config.medium_for(message.size);
        if let Some(link) = self.links.link_between(self.node, peer, Some(medium)) {
            return Some(link.id);
        }
        match self.links.try_connect(
            InterfaceId::new(self.node, medium),
            InterfaceId::new(peer, medium),
            self.env,
        ) {
            ConnectOutcome::Connected(id) => {
                if let Some(speed) = self.links.link(id).map(|l| l.speed) {
                    self.schedule.record_up(self.node, peer, self.now, speed);
                }
                self.routes.invalidate(self.node);
                self.routes.invalidate(peer);
                self.realized += 1;
                debug!(node = %self.node, peer = %peer, link = %id, "link realized on demand");
                Some(id)
            }
            ConnectOutcome::AlreadyLinked(id) => Some(id),
            ConnectOutcome::Refused(reason) => {
                trace!(node = %self.node, peer = %peer, ?reason, "link not realizable");
                None
            }
        }
    }

    fn busy_until(&self, peer: NodeAddress, link: LinkId) -> Option<SimTime> {
        let on_link = self
            .links
            .link(link)
            .and_then(|l| l.in_flight())
            .map(|f| f.done_at);
        on_link.into_iter().chain(self.links.busy_until(peer)).reduce(f64::max)
    }

    fn invalidate_routes(&mut self) {
        warn!(node = %self.node, "routing table named an unreachable hop, refreshing");
        self.routes.invalidate(self.node);
    }

    fn fallback(&mut self, message: &Message) -> Option<NodeAddress> {
        if !self.routes.config.relay_fallback {
            return None;
        }
        let tier = self.env.directory.tier(self.node)?;
        let medium = self.routes.config.medium_for(message.size);
        let ctx = ViewContext::new(self.env.directory, self.links, self.routes.config, medium);
        let relays = self
            .routes
            .views
            .for_tier(tier)
            .fallback_relays(&ctx, self.node, message.destination);
        let mut rng = StdRng::seed_from_u64(search_seed(
            self.routes.config.rng_seed,
            self.node,
            self.routes.tick,
            u32::MAX,
        ));
        relays.choose(&mut rng).copied()
    }
}
