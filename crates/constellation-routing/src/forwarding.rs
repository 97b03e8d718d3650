//! Per-message forwarding decision
//!
//! State machine, one pass per message per tick:
//!
//! ```text
//! NoPathCached -> PathFromHeader | PathFromTable -> LinkPending -> Sent
//!                                                              \-> RetryWait
//! ```
//!
//! A busy next hop or a may-wait hop defers the message to a later tick.
//! A stale embedded path is dropped whole and the table is consulted.
//! No path at all leaves the message queued as unroutable for this tick.

use crate::link::LinkId;
use crate::types::{HopPath, Message, NodeAddress, SimTime};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ForwardingState {
    NoPathCached,
    PathFromHeader,
    PathFromTable,
    LinkPending,
    Sent,
    RetryWait,
}

/// Where the chosen next hop came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathSource {
    Header,
    Table,
    /// Relay chosen when no scoped path exists
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ForwardingOutcome {
    Forward {
        next_hop: NodeAddress,
        link: LinkId,
        source: PathSource,
    },
    /// Next hop busy or waiting for a contact; retry at `until` or later
    Deferred { next_hop: NodeAddress, until: SimTime },
    /// No path this tick; the message stays queued
    Unroutable,
}

impl ForwardingOutcome {
    pub fn next_hop(&self) -> Option<NodeAddress> {
        match self {
            ForwardingOutcome::Forward { next_hop, .. }
            | ForwardingOutcome::Deferred { next_hop, .. } => Some(*next_hop),
            ForwardingOutcome::Unroutable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub outcome: ForwardingOutcome,
    /// States visited, in order
    pub trace: Vec<ForwardingState>,
}

/// What the decision needs from the node it runs on
pub trait ForwardingContext {
    fn node(&self) -> NodeAddress;

    fn now(&self) -> SimTime;

    /// Path to the message's destination avoiding `excluded`
    fn route(&mut self, message: &Message, excluded: &BTreeSet<NodeAddress>, attempt: u32) -> Option<HopPath>;

    /// Live link to `peer`, realized on demand when possible
    fn link_to(&mut self, peer: NodeAddress, message: &Message) -> Option<LinkId>;

    /// Time `peer` or the link frees up, when either is transferring
    fn busy_until(&self, peer: NodeAddress, link: LinkId) -> Option<SimTime>;

    /// Cached routes named a hop that cannot be reached
    fn invalidate_routes(&mut self) {}

    /// Relay to hand the message to when no scoped path exists
    fn fallback(&mut self, _message: &Message) -> Option<NodeAddress> {
        None
    }
}

/// Outcome of trying one hop
enum HopAttempt {
    Ready(LinkId),
    Busy(SimTime),
    Wait,
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct Forwarder {
    embed_path: bool,
    retry_cap: u32,
}

impl Forwarder {
    pub fn new(embed_path: bool, retry_cap: u32) -> Self {
        Self {
            embed_path,
            retry_cap,
        }
    }

    fn attempt<C: ForwardingContext + ?Sized>(
        ctx: &mut C,
        message: &Message,
        next_hop: NodeAddress,
        may_wait: bool,
    ) -> HopAttempt {
        match ctx.link_to(next_hop, message) {
            Some(link) => match ctx.busy_until(next_hop, link) {
                None => HopAttempt::Ready(link),
                Some(until) => HopAttempt::Busy(until),
            },
            None if may_wait => HopAttempt::Wait,
            None => HopAttempt::Stale,
        }
    }

    pub fn decide<C: ForwardingContext + ?Sized>(&self, ctx: &mut C, message: &mut Message) -> Decision {
        let node = ctx.node();
        let now = ctx.now();
        let mut trace = vec![ForwardingState::NoPathCached];
        let mut excluded = BTreeSet::new();
        let mut busy: Option<(NodeAddress, SimTime)> = None;

        if self.embed_path && message.embedded_path().is_some() {
            match message.embedded_next_hop(node) {
                Some(hop) => {
                    trace.push(ForwardingState::PathFromHeader);
                    trace.push(ForwardingState::LinkPending);
                    match Self::attempt(ctx, message, hop.address, hop.may_wait) {
                        HopAttempt::Ready(link) => {
                            trace.push(ForwardingState::Sent);
                            message.clear_busy();
                            return Decision {
                                outcome: ForwardingOutcome::Forward {
                                    next_hop: hop.address,
                                    link,
                                    source: PathSource::Header,
                                },
                                trace,
                            };
                        }
                        HopAttempt::Busy(until) => {
                            busy = Some((hop.address, until));
                            excluded.insert(hop.address);
                        }
                        HopAttempt::Wait => {
                            trace.push(ForwardingState::RetryWait);
                            message.mark_busy(hop.address, now);
                            return Decision {
                                outcome: ForwardingOutcome::Deferred {
                                    next_hop: hop.address,
                                    until: now,
                                },
                                trace,
                            };
                        }
                        HopAttempt::Stale => {
                            debug!(node = %node, message = %message.id, next_hop = %hop.address, "embedded path stale, discarding");
                            message.clear_path();
                        }
                    }
                }
                None => message.clear_path(),
            }
        }

        for attempt in 0..=self.retry_cap {
            let Some(path) = ctx.route(message, &excluded, attempt) else {
                break;
            };
            let Some(hop) = path.first().copied() else {
                break;
            };
            trace.push(ForwardingState::PathFromTable);
            if self.embed_path {
                message.attach_path(node, path);
            }
            trace.push(ForwardingState::LinkPending);
            match Self::attempt(ctx, message, hop.address, hop.may_wait) {
                HopAttempt::Ready(link) => {
                    trace.push(ForwardingState::Sent);
                    message.clear_busy();
                    return Decision {
                        outcome: ForwardingOutcome::Forward {
                            next_hop: hop.address,
                            link,
                            source: PathSource::Table,
                        },
                        trace,
                    };
                }
                HopAttempt::Busy(until) => {
                    debug!(node = %node, next_hop = %hop.address, attempt, "next hop busy, excluding");
                    busy.get_or_insert((hop.address, until));
                    excluded.insert(hop.address);
                }
                HopAttempt::Wait => {
                    trace.push(ForwardingState::RetryWait);
                    message.mark_busy(hop.address, now);
                    return Decision {
                        outcome: ForwardingOutcome::Deferred {
                            next_hop: hop.address,
                            until: now,
                        },
                        trace,
                    };
                }
                HopAttempt::Stale => {
                    ctx.invalidate_routes();
                    excluded.insert(hop.address);
                }
            }
        }

        if busy.is_none() {
            if let Some(relay) = ctx.fallback(message) {
                trace.push(ForwardingState::LinkPending);
                match Self::attempt(ctx, message, relay, false) {
                    HopAttempt::Ready(link) => {
                        trace.push(ForwardingState::Sent);
                        message.clear_path();
                        message.clear_busy();
                        return Decision {
                            outcome: ForwardingOutcome::Forward {
                                next_hop: relay,
                                link,
                                source: PathSource::Fallback,
                            },
                            trace,
                        };
                    }
                    HopAttempt::Busy(until) => busy = Some((relay, until)),
                    HopAttempt::Wait | HopAttempt::Stale => {}
                }
            }
        }

        match busy {
            Some((next_hop, until)) => {
                trace.push(ForwardingState::RetryWait);
                message.mark_busy(next_hop, until);
                Decision {
                    outcome: ForwardingOutcome::Deferred { next_hop, until },
                    trace,
                }
            }
            None => {
                message.clear_path();
                Decision {
                    outcome: ForwardingOutcome::Unroutable,
                    trace,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hop;
    use std::collections::BTreeMap;

    const SELF: NodeAddress = NodeAddress(1);
    const B: NodeAddress = NodeAddress(2);
    const C: NodeAddress = NodeAddress(3);
    const D: NodeAddress = NodeAddress(4);

    #[derive(Default)]
    struct MockContext {
        paths: Vec<HopPath>,
        links: BTreeMap<NodeAddress, LinkId>,
        busy: BTreeMap<NodeAddress, SimTime>,
        relay: Option<NodeAddress>,
        route_calls: u32,
        invalidations: u32,
    }

    impl MockContext {
        fn with_path(mut self, hops: &[(NodeAddress, bool)]) -> Self {
            self.paths.push(HopPath::from_hops(
                hops.iter().map(|&(a, w)| Hop::new(a, w)).collect(),
            ));
            self
        }

        fn with_link(mut self, peer: NodeAddress) -> Self {
            let id = LinkId(peer.0 as u64);
            self.links.insert(peer, id);
            self
        }

        fn with_busy(mut self, peer: NodeAddress, until: SimTime) -> Self {
            self.busy.insert(peer, until);
            self
        }
    }

    impl ForwardingContext for MockContext {
        fn node(&self) -> NodeAddress {
            SELF
        }

        fn now(&self) -> SimTime {
            10.0
        }

        fn route(&mut self, _message: &Message, excluded: &BTreeSet<NodeAddress>, _attempt: u32) -> Option<HopPath> {
            self.route_calls += 1;
            self.paths
                .iter()
                .find(|p| p.first().is_some_and(|h| !excluded.contains(&h.address)))
                .cloned()
        }

        fn link_to(&mut self, peer: NodeAddress, _message: &Message) -> Option<LinkId> {
            self.links.get(&peer).copied()
        }

        fn busy_until(&self, peer: NodeAddress, _link: LinkId) -> Option<SimTime> {
            self.busy.get(&peer).copied()
        }

        fn invalidate_routes(&mut self) {
            self.invalidations += 1;
        }

        fn fallback(&mut self, _message: &Message) -> Option<NodeAddress> {
            self.relay
        }
    }

    fn create_test_message() -> Message {
        Message::new("m1", SELF, D, 1_000, 0.0)
    }

    fn header(hops: &[(NodeAddress, bool)]) -> HopPath {
        HopPath::from_hops(hops.iter().map(|&(a, w)| Hop::new(a, w)).collect())
    }

    #[test]
    fn test_header_path_skips_recomputation() {
        let mut ctx = MockContext::default().with_link(B);
        let mut msg = create_test_message().with_path(SELF, header(&[(B, false), (D, false)]));

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(
            decision.outcome,
            ForwardingOutcome::Forward { next_hop: B, link: LinkId(2), source: PathSource::Header }
        );
        assert_eq!(
            decision.trace,
            vec![
                ForwardingState::NoPathCached,
                ForwardingState::PathFromHeader,
                ForwardingState::LinkPending,
                ForwardingState::Sent
            ]
        );
        assert_eq!(ctx.route_calls, 0);
    }

    #[test]
    fn test_stale_header_is_discarded_whole() {
        let mut ctx = MockContext::default()
            .with_link(C)
            .with_path(&[(C, false), (D, false)]);
        let mut msg = create_test_message().with_path(SELF, header(&[(B, false), (D, true)]));

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(decision.outcome.next_hop(), Some(C));
        assert_eq!(ctx.route_calls, 1);
        let path: Vec<_> = msg.embedded_path().unwrap().addresses().collect();
        assert_eq!(path, vec![C, D]);
        assert!(!msg.embedded_path().unwrap().hops()[1].may_wait);
    }

    #[test]
    fn test_may_wait_hop_defers_and_keeps_header() {
        let mut ctx = MockContext::default();
        let mut msg = create_test_message().with_path(SELF, header(&[(B, true), (D, false)]));

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(
            decision.outcome,
            ForwardingOutcome::Deferred { next_hop: B, until: 10.0 }
        );
        assert!(msg.embedded_path().is_some());
        assert_eq!(decision.trace.last(), Some(&ForwardingState::RetryWait));
    }

    #[test]
    fn test_table_path_is_embedded_when_enabled() {
        let mut ctx = MockContext::default()
            .with_link(B)
            .with_path(&[(B, false), (D, false)]);
        let mut msg = create_test_message();
        Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(msg.path_writer(), Some(SELF));
        assert_eq!(msg.embedded_next_hop(B).map(|h| h.address), Some(D));

        let mut ctx = MockContext::default()
            .with_link(B)
            .with_path(&[(B, false), (D, false)]);
        let mut msg = create_test_message();
        let decision = Forwarder::new(false, 3).decide(&mut ctx, &mut msg);
        assert!(matches!(
            decision.outcome,
            ForwardingOutcome::Forward { source: PathSource::Table, .. }
        ));
        assert!(msg.embedded_path().is_none());
    }

    #[test]
    fn test_busy_only_neighbor_defers() {
        let mut ctx = MockContext::default()
            .with_link(B)
            .with_busy(B, 14.0)
            .with_path(&[(B, false), (D, false)]);
        let mut msg = create_test_message();

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(
            decision.outcome,
            ForwardingOutcome::Deferred { next_hop: B, until: 14.0 }
        );
        assert_eq!(msg.busy_until(B), Some(14.0));
        assert_eq!(decision.trace.last(), Some(&ForwardingState::RetryWait));
    }

    #[test]
    fn test_busy_hop_retries_around_it() {
        let mut ctx = MockContext::default()
            .with_link(B)
            .with_link(C)
            .with_busy(B, 14.0)
            .with_path(&[(B, false), (D, false)])
            .with_path(&[(C, false), (D, false)]);
        let mut msg = create_test_message();

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(decision.outcome.next_hop(), Some(C));
        assert_eq!(ctx.route_calls, 2);
        assert!(msg.busy_until(B).is_none());
    }

    #[test]
    fn test_no_path_is_unroutable() {
        let mut ctx = MockContext::default();
        let mut msg = create_test_message().with_path(SELF, header(&[(B, false), (D, false)]));

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(decision.outcome, ForwardingOutcome::Unroutable);
        assert!(msg.embedded_path().is_none());
    }

    #[test]
    fn test_retry_cap_bounds_recomputation() {
        let mut ctx = MockContext::default();
        for peer in 2..20 {
            let addr = NodeAddress(peer);
            ctx = ctx.with_link(addr).with_busy(addr, 11.0).with_path(&[(addr, false)]);
        }
        let mut msg = create_test_message();

        let decision = Forwarder::new(true, 2).decide(&mut ctx, &mut msg);
        assert_eq!(ctx.route_calls, 3);
        assert_eq!(
            decision.outcome,
            ForwardingOutcome::Deferred { next_hop: NodeAddress(2), until: 11.0 }
        );
    }

    #[test]
    fn test_stale_table_entry_forces_refresh() {
        let mut ctx = MockContext::default()
            .with_link(C)
            .with_path(&[(B, false), (D, false)])
            .with_path(&[(C, false), (D, false)]);
        let mut msg = create_test_message();

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(decision.outcome.next_hop(), Some(C));
        assert_eq!(ctx.invalidations, 1);
    }

    #[test]
    fn test_fallback_relay_when_no_path() {
        let mut ctx = MockContext::default().with_link(C);
        ctx.relay = Some(C);
        let mut msg = create_test_message();

        let decision = Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert_eq!(
            decision.outcome,
            ForwardingOutcome::Forward { next_hop: C, link: LinkId(3), source: PathSource::Fallback }
        );
    }

    #[test]
    fn test_final_hop_clears_header() {
        let mut ctx = MockContext::default();
        let mut msg = Message::new("m1", C, SELF, 10, 0.0).with_path(C, header(&[(B, false), (SELF, false)]));

        Forwarder::new(true, 3).decide(&mut ctx, &mut msg);
        assert!(msg.embedded_path().is_none());
    }
}
