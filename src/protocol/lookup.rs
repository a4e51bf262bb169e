use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::core::identifier::{Distance, NodeId, PeerInfo};
use crate::core::storage::Value;
use crate::error::DhtError;
use crate::protocol::wire::RpcMessage;

/// Which RPC the lookup converges with.
#[derive(Debug, Clone, Copy)]
pub(super) enum LookupKind {
    Node,  // FIND_NODE
    Value, // FIND_VALUE
}

/// State of one iterative lookup.
///
/// The shortlist holds the best candidates seen so far, ascending by XOR
/// distance to the target and capped at 3k to bound memory. Queries go out
/// to the first k entries, at most `alpha` in flight; a round that fails to
/// improve the closest distance triggers the termination sweep, which
/// queries every remaining unqueried candidate in the top k and then stops.
#[derive(Debug)]
pub(super) struct Lookup {
    k: usize,
    alpha: usize,
    my_node_id: NodeId,
    target: NodeId,
    kind: LookupKind,
    query_timeout: Duration,
    short_list: Vec<PeerInfo>,
    already_queried: HashSet<NodeId>,
    responded: HashSet<NodeId>,
    in_flight: HashMap<NodeId, Instant>,
    closest_seen: Option<Distance>,
    round_improved: bool,
    sweeping: bool,
}

impl Lookup {
    pub(super) fn new(
        k: usize,
        alpha: usize,
        my_node_id: NodeId,
        target: NodeId,
        kind: LookupKind,
        query_timeout: Duration,
        initial_candidates: Vec<PeerInfo>,
    ) -> Self {
        let mut lookup = Self {
            k,
            alpha,
            my_node_id,
            target,
            kind,
            query_timeout,
            short_list: Vec::new(),
            already_queried: HashSet::new(),
            responded: HashSet::new(),
            in_flight: HashMap::new(),
            closest_seen: None,
            round_improved: false,
            sweeping: false,
        };
        lookup.merge_new_nodes(initial_candidates);
        lookup
    }

    fn shortlist_cap(&self) -> usize {
        3 * self.k
    }

    /// Send queries until `alpha` are in flight (or, during the
    /// termination sweep, to every unqueried candidate in the top k).
    pub(super) fn top_up(&mut self) -> Vec<super::Effect> {
        let slots = if self.sweeping {
            self.k
        } else {
            self.alpha.saturating_sub(self.in_flight.len())
        };

        let candidates: Vec<PeerInfo> = self
            .short_list
            .iter()
            .take(self.k)
            .filter(|c| !self.already_queried.contains(&c.node_id))
            .take(slots)
            .copied()
            .collect();

        let mut effects = Vec::new();
        for peer in candidates {
            let message = match self.kind {
                LookupKind::Node => RpcMessage::find_node(self.my_node_id, self.target),
                LookupKind::Value => RpcMessage::find_value(self.my_node_id, self.target),
            };
            effects.push(super::Effect::Send {
                addr: peer.addr(),
                message,
            });
            self.already_queried.insert(peer.node_id);
            self.in_flight
                .insert(peer.node_id, Instant::now() + self.query_timeout);
        }
        effects
    }

    /// Record a node-bearing reply and fold its peers into the shortlist.
    pub(super) fn on_reply(&mut self, responder: NodeId, peers: Vec<PeerInfo>) {
        self.in_flight.remove(&responder);
        self.responded.insert(responder);
        if self.merge_new_nodes(peers) {
            self.round_improved = true;
        }
        self.end_round_if_idle();
    }

    /// Merge candidates, keeping the shortlist sorted, deduplicated, free
    /// of our own id, and capped. Returns whether the closest distance
    /// seen so far improved.
    fn merge_new_nodes(&mut self, nodes: Vec<PeerInfo>) -> bool {
        self.short_list.extend(nodes);

        let mut seen = HashSet::new();
        let my_id = self.my_node_id;
        self.short_list
            .retain(|n| n.node_id != my_id && seen.insert(n.node_id));
        self.short_list
            .sort_by_key(|n| (n.node_id.distance(&self.target), n.node_id));
        self.short_list.truncate(self.shortlist_cap());

        let best = self
            .short_list
            .first()
            .map(|n| n.node_id.distance(&self.target));
        match (best, self.closest_seen) {
            (Some(b), Some(current)) if b < current => {
                self.closest_seen = Some(b);
                true
            }
            (Some(b), None) => {
                self.closest_seen = Some(b);
                true
            }
            _ => false,
        }
    }

    /// Drop queries past their deadline. The timed-out peers leave the
    /// shortlist; the caller reports them to the routing table.
    pub(super) fn sweep_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.in_flight.remove(id);
            self.short_list.retain(|n| n.node_id != *id);
        }
        if !expired.is_empty() {
            self.end_round_if_idle();
        }
        expired
    }

    fn end_round_if_idle(&mut self) {
        if self.in_flight.is_empty() {
            if !self.round_improved {
                self.sweeping = true;
            }
            self.round_improved = false;
        }
    }

    pub(super) fn is_finished(&self) -> bool {
        self.in_flight.is_empty() && !self.has_unqueried_in_top_k()
    }

    fn has_unqueried_in_top_k(&self) -> bool {
        self.short_list
            .iter()
            .take(self.k)
            .any(|n| !self.already_queried.contains(&n.node_id))
    }

    /// The first k shortlist entries that actually answered.
    pub(super) fn results(&self) -> Vec<PeerInfo> {
        self.short_list
            .iter()
            .filter(|n| self.responded.contains(&n.node_id))
            .take(self.k)
            .copied()
            .collect()
    }

    /// A lookup with no responders at all is a terminal failure.
    pub(super) fn failed(&self) -> bool {
        self.responded.is_empty()
    }
}

/// A lookup in the endpoint's table, together with its completion channels
/// and, for Put-initiated lookups, the value to replicate afterwards.
pub(super) struct PendingLookup {
    pub(super) lookup: Lookup,
    pub(super) deadline: Instant,
    pub(super) put_value: Option<Value>,
    pub(super) tx_done: Option<oneshot::Sender<Result<(), DhtError>>>,
    pub(super) tx_value: Option<oneshot::Sender<Result<Option<Value>, DhtError>>>,
}
