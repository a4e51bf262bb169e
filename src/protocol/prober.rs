use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::core::identifier::{NodeId, PeerInfo};

/// One outstanding PING liveness probe: the LRU under test and when to
/// give up on it.
#[derive(Debug, Clone, Copy)]
pub(super) struct PendingProbe {
    pub(super) peer: PeerInfo,
    pub(super) deadline: Instant,
}

/// Bookkeeping for in-flight liveness probes.
///
/// The wire format carries no correlation id, so replies are matched by
/// sender id; at most one probe per peer is outstanding (each bucket's
/// single replacement slot enforces this upstream). Completion and expiry
/// only report outcomes; committing them to the routing table is the
/// caller's job, outside any table lock.
#[derive(Debug)]
pub(super) struct Prober {
    timeout: Duration,
    pending: HashMap<NodeId, PendingProbe>,
}

impl Prober {
    pub(super) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Register a probe of `peer`. Returns false if one is already out.
    pub(super) fn begin(&mut self, peer: PeerInfo) -> bool {
        if self.pending.contains_key(&peer.node_id) {
            return false;
        }
        self.pending.insert(
            peer.node_id,
            PendingProbe {
                peer,
                deadline: Instant::now() + self.timeout,
            },
        );
        true
    }

    /// Consume the probe answered by `node_id`, if any.
    pub(super) fn complete(&mut self, node_id: NodeId) -> Option<PendingProbe> {
        self.pending.remove(&node_id)
    }

    /// Remove and return every probe whose deadline has passed.
    pub(super) fn sweep(&mut self, now: Instant) -> Vec<PendingProbe> {
        let expired: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, probe)| probe.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}
