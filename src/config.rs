use std::time::Duration;

/// Tunable parameters for a DHT node.
///
/// The defaults are the usual Kademlia paper values: `k = 20` bounds both
/// bucket capacity and lookup result width, `alpha = 3` bounds lookup
/// parallelism.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// How often the background task sweeps the routing table.
    pub refresh_interval: Duration,
    /// Peers not seen for this long are pruned by the refresh sweep.
    pub stale_threshold: Duration,
    /// Global cap on peers across all buckets.
    pub max_peers: usize,
    /// Bucket capacity and lookup result width.
    pub k: usize,
    /// Number of lookup queries kept in flight.
    pub alpha: usize,
    /// Deadline for a single lookup query.
    pub query_timeout: Duration,
    /// Deadline for a liveness probe round-trip.
    pub probe_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(300),
            max_peers: 1000,
            k: 20,
            alpha: 3,
            query_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
        }
    }
}
