use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use super::identifier::{NodeId, PeerInfo, ID_BITS};
use crate::error::DhtError;

/// Outcome of offering a peer to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended as the newest entry of its bucket.
    Inserted,
    /// A peer with the same id was already present; its entry was updated
    /// and moved to the most-recently-seen position.
    Refreshed,
    /// The bucket is full. The caller must probe the returned
    /// least-recently-seen peer (outside the table lock) and commit the
    /// outcome via `resolve_probe`; until then the candidate waits in the
    /// bucket's replacement slot.
    ProbeLru { lru: PeerInfo },
    /// The bucket is full and a probe is already outstanding; the candidate
    /// took over the replacement slot.
    Queued,
}

/// The candidate waiting for a liveness verdict on a bucket's LRU peer.
#[derive(Debug, Clone, Copy)]
struct PendingReplacement {
    candidate: PeerInfo,
    lru_id: NodeId,
    since: SystemTime,
}

/// A bounded list of peers sharing one log-distance class.
///
/// Order invariant: least-recently-seen at the front, most-recently-seen at
/// the back. No duplicate node ids. At most one replacement candidate is
/// parked per bucket, which also bounds outstanding probes per bucket to 1.
#[derive(Debug)]
pub(crate) struct KBucket {
    k: usize,
    peers: VecDeque<PeerInfo>,
    pending: Option<PendingReplacement>,
}

impl KBucket {
    fn new(k: usize) -> Self {
        Self {
            k,
            peers: VecDeque::with_capacity(k),
            pending: None,
        }
    }

    fn add(&mut self, peer: PeerInfo) -> Result<AddOutcome, DhtError> {
        if !peer.is_valid() {
            return Err(DhtError::InvalidPeer);
        }

        if let Some(pos) = self.peers.iter().position(|p| p.node_id == peer.node_id) {
            // Same id: take the fresh contact info and move to MRU.
            self.peers.remove(pos);
            self.peers.push_back(peer);
            if self
                .pending
                .map_or(false, |pending| pending.lru_id == peer.node_id)
            {
                // The peer under probe just reached us on its own; the
                // probe is moot and the waiting candidate loses to it.
                self.pending = None;
            }
            return Ok(AddOutcome::Refreshed);
        }

        if self.peers.len() < self.k {
            self.peers.push_back(peer);
            return Ok(AddOutcome::Inserted);
        }

        if let Some(pending) = &mut self.pending {
            // One probe at a time per bucket; the newest candidate holds
            // the replacement slot.
            pending.candidate = peer;
            return Ok(AddOutcome::Queued);
        }

        let lru = *self.peers.front().expect("full bucket has a front entry");
        self.pending = Some(PendingReplacement {
            candidate: peer,
            lru_id: lru.node_id,
            since: SystemTime::now(),
        });
        Ok(AddOutcome::ProbeLru { lru })
    }

    /// Commit a probe verdict for this bucket's LRU. A verdict for a peer
    /// that is no longer the one under probe is stale and gets discarded.
    fn resolve_probe(&mut self, lru_id: NodeId, alive: bool) {
        let Some(pending) = self.pending else {
            return;
        };
        if pending.lru_id != lru_id {
            return;
        }
        self.pending = None;

        let Some(pos) = self.peers.iter().position(|p| p.node_id == lru_id) else {
            return;
        };
        if alive {
            // Kademlia prefers the old: refresh the incumbent, drop the candidate.
            let mut lru = self.peers.remove(pos).expect("position just located");
            lru.touch();
            self.peers.push_back(lru);
        } else {
            self.peers.remove(pos);
            self.peers.push_back(pending.candidate);
        }
    }

    fn remove_stale(&mut self, threshold: Duration, now: SystemTime) {
        self.peers.retain(|p| !p.is_stale(threshold, now));
        if let Some(pending) = self.pending {
            let lru_gone = !self.peers.iter().any(|p| p.node_id == pending.lru_id);
            let probe_stale = now
                .duration_since(pending.since)
                .map_or(false, |age| age >= threshold);
            if lru_gone || probe_stale {
                self.pending = None;
            }
        }
    }

    fn remove(&mut self, node_id: NodeId) -> bool {
        if self
            .pending
            .map_or(false, |pending| pending.lru_id == node_id)
        {
            self.pending = None;
        }
        if let Some(pos) = self.peers.iter().position(|p| p.node_id == node_id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    fn find(&self, node_id: NodeId) -> Option<PeerInfo> {
        self.peers.iter().find(|p| p.node_id == node_id).copied()
    }

    fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}

/// 160 k-buckets indexed by log-distance from the local id.
///
/// A flat array rather than a prefix tree: insertion dispatch is O(1), the
/// concurrency story is one reader-writer lock over the whole array, and a
/// real network populates only a logarithmic fraction of buckets anyway.
/// The lock is never held across an await; probes happen outside it.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: RwLock<Vec<KBucket>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| KBucket::new(k)).collect();
        Self {
            self_id,
            k,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Offer a peer to its log-distance bucket. The local id is never
    /// stored: log-distance 0 belongs to genuine closest peers.
    pub fn add_peer(&self, peer: PeerInfo) -> Result<AddOutcome, DhtError> {
        if peer.node_id == self.self_id || !peer.is_valid() {
            return Err(DhtError::InvalidPeer);
        }
        let index = self.self_id.log_distance(&peer.node_id);
        let mut buckets = self.buckets.write().expect("routing table lock poisoned");
        let outcome = buckets[index].add(peer)?;
        trace!(
            "bucket {index}: {:?} for peer {}",
            outcome,
            peer.node_id.short_hex()
        );
        Ok(outcome)
    }

    /// Like `add_peer`, but refuses to grow the table past `max_peers`.
    /// Updates to peers already present are always allowed.
    pub fn add_peer_bounded(
        &self,
        peer: PeerInfo,
        max_peers: usize,
    ) -> Result<AddOutcome, DhtError> {
        if peer.node_id == self.self_id {
            return Err(DhtError::InvalidPeer);
        }
        let index = self.self_id.log_distance(&peer.node_id);
        let mut buckets = self.buckets.write().expect("routing table lock poisoned");
        let count: usize = buckets.iter().map(KBucket::len).sum();
        if count >= max_peers && buckets[index].find(peer.node_id).is_none() {
            return Err(DhtError::PeerLimitExceeded);
        }
        buckets[index].add(peer)
    }

    pub fn find_peer(&self, node_id: NodeId) -> Option<PeerInfo> {
        let index = self.self_id.log_distance(&node_id);
        let buckets = self.buckets.read().expect("routing table lock poisoned");
        buckets[index].find(node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.find_peer(node_id).is_some()
    }

    /// The up-to-`k` known peers closest to `target` by XOR distance.
    ///
    /// Buckets are consumed outward from the target's log-distance class
    /// until enough candidates are gathered, then the candidates are sorted
    /// by distance (ties broken by id bytes) and truncated.
    pub fn find_closest(&self, target: NodeId, k: usize) -> Vec<PeerInfo> {
        let mut found = Vec::new();
        {
            let buckets = self.buckets.read().expect("routing table lock poisoned");
            let start = self.self_id.log_distance(&target);
            for offset in 0..ID_BITS {
                if found.len() >= k {
                    break;
                }
                if start + offset < ID_BITS {
                    found.extend(buckets[start + offset].iter().copied());
                }
                if offset > 0 && start >= offset {
                    found.extend(buckets[start - offset].iter().copied());
                }
            }
        }
        found.sort_by_key(|p| (p.node_id.distance(&target), p.node_id));
        found.truncate(k);
        found
    }

    /// Prune every peer not seen within `threshold`.
    pub fn refresh(&self, threshold: Duration) {
        let now = SystemTime::now();
        let mut buckets = self.buckets.write().expect("routing table lock poisoned");
        let before: usize = buckets.iter().map(KBucket::len).sum();
        for bucket in buckets.iter_mut() {
            bucket.remove_stale(threshold, now);
        }
        let after: usize = buckets.iter().map(KBucket::len).sum();
        if after < before {
            debug!("refresh pruned {} stale peers", before - after);
        }
    }

    pub fn peer_count(&self) -> usize {
        let buckets = self.buckets.read().expect("routing table lock poisoned");
        buckets.iter().map(KBucket::len).sum()
    }

    /// Commit a liveness verdict for a probed peer.
    pub fn resolve_probe(&self, peer: PeerInfo, alive: bool) {
        let index = self.self_id.log_distance(&peer.node_id);
        let mut buckets = self.buckets.write().expect("routing table lock poisoned");
        buckets[index].resolve_probe(peer.node_id, alive);
        if !alive {
            debug!("evicted unresponsive peer {}", peer.node_id.short_hex());
        }
    }

    /// Drop a peer outright, e.g. after it timed out during a lookup.
    pub fn remove_peer(&self, node_id: NodeId) -> bool {
        let index = self.self_id.log_distance(&node_id);
        let mut buckets = self.buckets.write().expect("routing table lock poisoned");
        buckets[index].remove(node_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::{id_with_first_byte, make_peer};
    use std::sync::Arc;

    // All first bytes with the top bit set land in bucket 159 relative to a
    // zero self id, which makes it easy to fill a single bucket.
    fn far_peer(last_octet: u8, port: u16, sub: u8) -> PeerInfo {
        make_peer(last_octet, port, 0x80 | sub)
    }

    #[test]
    fn insert_and_count() {
        let rt = RoutingTable::new(NodeId::random(), 20);
        assert_eq!(rt.peer_count(), 0);

        rt.add_peer(make_peer(1, 4001, 0x02)).unwrap();
        rt.add_peer(make_peer(2, 4002, 0x03)).unwrap();
        rt.add_peer(make_peer(3, 4003, 0x04)).unwrap();
        assert_eq!(rt.peer_count(), 3);
    }

    #[test]
    fn rejects_self_and_invalid_peers() {
        let self_id = id_with_first_byte(0xAA);
        let rt = RoutingTable::new(self_id, 20);

        let mut own = make_peer(1, 4001, 0);
        own.node_id = self_id;
        assert!(matches!(rt.add_peer(own), Err(DhtError::InvalidPeer)));

        assert!(matches!(
            rt.add_peer(PeerInfo::default()),
            Err(DhtError::InvalidPeer)
        ));

        let mut dead_port = make_peer(1, 4001, 0x02);
        dead_port.udp_port = 0;
        assert!(matches!(rt.add_peer(dead_port), Err(DhtError::InvalidPeer)));
        assert_eq!(rt.peer_count(), 0);
    }

    #[test]
    fn find_after_add() {
        let rt = RoutingTable::new(id_with_first_byte(0xAA), 20);
        let peer = make_peer(1, 4001, 0x02);
        rt.add_peer(peer).unwrap();
        let found = rt.find_peer(peer.node_id).expect("peer should be present");
        assert_eq!(found.node_id, peer.node_id);
        assert_eq!(found.udp_port, 4001);
        assert!(!rt.contains(id_with_first_byte(0x55)));
    }

    #[test]
    fn duplicate_id_refreshes_in_place() {
        let rt = RoutingTable::new(NodeId::zero(), 3);
        rt.add_peer(far_peer(1, 4001, 1)).unwrap();
        rt.add_peer(far_peer(2, 4002, 2)).unwrap();

        // same id, new contact info
        let updated = far_peer(9, 4009, 1);
        assert_eq!(rt.add_peer(updated).unwrap(), AddOutcome::Refreshed);
        assert_eq!(rt.peer_count(), 2);
        assert_eq!(rt.find_peer(updated.node_id).unwrap().udp_port, 4009);
    }

    #[test]
    fn full_bucket_asks_for_probe_then_queues() {
        let rt = RoutingTable::new(NodeId::zero(), 2);
        let p1 = far_peer(1, 4001, 1);
        let p2 = far_peer(2, 4002, 2);
        rt.add_peer(p1).unwrap();
        rt.add_peer(p2).unwrap();

        let c1 = far_peer(3, 4003, 3);
        match rt.add_peer(c1).unwrap() {
            AddOutcome::ProbeLru { lru } => assert_eq!(lru.node_id, p1.node_id),
            other => panic!("expected ProbeLru, got {other:?}"),
        }

        // a second candidate while the probe is out just takes the slot
        let c2 = far_peer(4, 4004, 4);
        assert_eq!(rt.add_peer(c2).unwrap(), AddOutcome::Queued);
        assert_eq!(rt.peer_count(), 2);
    }

    #[test]
    fn probe_success_keeps_incumbent() {
        let rt = RoutingTable::new(NodeId::zero(), 2);
        let p1 = far_peer(1, 4001, 1);
        let p2 = far_peer(2, 4002, 2);
        rt.add_peer(p1).unwrap();
        rt.add_peer(p2).unwrap();
        let candidate = far_peer(3, 4003, 3);
        let AddOutcome::ProbeLru { lru } = rt.add_peer(candidate).unwrap() else {
            panic!("expected ProbeLru");
        };

        rt.resolve_probe(lru, true);
        assert!(rt.contains(p1.node_id));
        assert!(!rt.contains(candidate.node_id));
        // the survivor moved to MRU: a further candidate now probes p2
        match rt.add_peer(far_peer(5, 4005, 5)).unwrap() {
            AddOutcome::ProbeLru { lru } => assert_eq!(lru.node_id, p2.node_id),
            other => panic!("expected ProbeLru on p2, got {other:?}"),
        }
    }

    #[test]
    fn probe_failure_admits_candidate() {
        let rt = RoutingTable::new(NodeId::zero(), 2);
        let p1 = far_peer(1, 4001, 1);
        rt.add_peer(p1).unwrap();
        rt.add_peer(far_peer(2, 4002, 2)).unwrap();
        let candidate = far_peer(3, 4003, 3);
        let AddOutcome::ProbeLru { lru } = rt.add_peer(candidate).unwrap() else {
            panic!("expected ProbeLru");
        };

        rt.resolve_probe(lru, false);
        assert!(!rt.contains(p1.node_id));
        assert!(rt.contains(candidate.node_id));
        assert_eq!(rt.peer_count(), 2);
    }

    #[test]
    fn probed_peer_reaching_us_merges_and_voids_probe() {
        let rt = RoutingTable::new(NodeId::zero(), 2);
        let p1 = far_peer(1, 4001, 1);
        rt.add_peer(p1).unwrap();
        rt.add_peer(far_peer(2, 4002, 2)).unwrap();
        let candidate = far_peer(3, 4003, 3);
        let AddOutcome::ProbeLru { lru } = rt.add_peer(candidate).unwrap() else {
            panic!("expected ProbeLru");
        };
        assert_eq!(lru.node_id, p1.node_id);

        // the LRU under probe contacts us directly: merge, no double entry
        assert_eq!(rt.add_peer(p1).unwrap(), AddOutcome::Refreshed);
        assert_eq!(rt.peer_count(), 2);

        // the late probe verdict must be discarded
        rt.resolve_probe(lru, false);
        assert!(rt.contains(p1.node_id));
        assert!(!rt.contains(candidate.node_id));
    }

    #[test]
    fn refresh_prunes_stale_peers() {
        let rt = RoutingTable::new(id_with_first_byte(0xAA), 20);
        let mut old = make_peer(1, 4001, 0x02);
        old.last_seen = SystemTime::now() - Duration::from_secs(5);
        rt.add_peer(old).unwrap();
        rt.add_peer(make_peer(2, 4002, 0x03)).unwrap();

        rt.refresh(Duration::from_secs(1));
        assert!(!rt.contains(old.node_id));
        assert_eq!(rt.peer_count(), 1);

        rt.refresh(Duration::ZERO);
        assert_eq!(rt.peer_count(), 0);
    }

    #[test]
    fn find_closest_is_sorted_and_bounded() {
        let rt = RoutingTable::new(NodeId::random(), 20);
        for i in 0..30 {
            rt.add_peer(PeerInfo::new(
                "127.0.0.1".parse().unwrap(),
                8000 + i,
                NodeId::random(),
            ))
            .unwrap();
        }

        let target = NodeId::random();
        let closest = rt.find_closest(target, 20);
        assert!(!closest.is_empty());
        assert!(closest.len() <= 20);

        let mut seen = std::collections::HashSet::new();
        for pair in closest.windows(2) {
            assert!(
                pair[0].node_id.distance(&target) <= pair[1].node_id.distance(&target),
                "results must be in non-decreasing distance order"
            );
        }
        for peer in &closest {
            assert!(seen.insert(peer.node_id), "no duplicate ids in results");
        }
    }

    #[test]
    fn find_closest_prefers_the_target_bucket() {
        let self_id = NodeId::zero();
        let rt = RoutingTable::new(self_id, 20);
        let near = make_peer(1, 4001, 0x01); // bucket 0 relative to 0x01-target
        let far = far_peer(2, 4002, 0);
        rt.add_peer(near).unwrap();
        rt.add_peer(far).unwrap();

        let closest = rt.find_closest(near.node_id, 1);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].node_id, near.node_id);
    }

    #[test]
    fn bounded_add_respects_the_cap() {
        let rt = RoutingTable::new(NodeId::random(), 20);
        let p1 = PeerInfo::new("127.0.0.1".parse().unwrap(), 4001, NodeId::random());
        rt.add_peer_bounded(p1, 1).unwrap();
        let p2 = PeerInfo::new("127.0.0.1".parse().unwrap(), 4002, NodeId::random());
        assert!(matches!(
            rt.add_peer_bounded(p2, 1),
            Err(DhtError::PeerLimitExceeded)
        ));
        // refreshing a known peer does not count against the cap
        assert_eq!(rt.add_peer_bounded(p1, 1).unwrap(), AddOutcome::Refreshed);
        assert_eq!(rt.peer_count(), 1);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let rt = Arc::new(RoutingTable::new(NodeId::random(), 20));
        let target = NodeId::random();

        let mut writers = Vec::new();
        for _ in 0..2 {
            let rt = Arc::clone(&rt);
            writers.push(std::thread::spawn(move || {
                for i in 0..1000u16 {
                    let peer =
                        PeerInfo::new("127.0.0.1".parse().unwrap(), 1 + i, NodeId::random());
                    let _ = rt.add_peer_bounded(peer, 1500);
                }
            }));
        }

        let reader = {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let closest = rt.find_closest(target, 20);
                    let mut seen = std::collections::HashSet::new();
                    for pair in closest.windows(2) {
                        assert!(
                            pair[0].node_id.distance(&target)
                                <= pair[1].node_id.distance(&target)
                        );
                    }
                    for peer in &closest {
                        assert!(peer.is_valid());
                        assert!(seen.insert(peer.node_id));
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert!(rt.peer_count() <= 1500);
    }
}
