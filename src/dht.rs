use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, trace};

use crate::config::DhtConfig;
use crate::core::identifier::{Key, NodeId, PeerInfo};
use crate::core::routing_table::{AddOutcome, RoutingTable};
use crate::core::storage::{Storage, Value};
use crate::error::{DhtError, Result};
use crate::protocol::{Command, RpcEndpoint};
use crate::transport::{Transport, UdpTransport};

const COMMAND_QUEUE: usize = 100;
const INBOUND_QUEUE: usize = 1024;

/// A running DHT node.
///
/// Owns the endpoint task and the background refresh loop, and shares the
/// routing table and local store with them. Table reads and writes go
/// straight through the shared table; network operations are funneled into
/// the endpoint task over the command channel.
pub struct Dht {
    config: DhtConfig,
    node_info: PeerInfo,
    routing_table: Arc<RoutingTable>,
    storage: Arc<Mutex<Storage>>,
    tx: mpsc::Sender<Command>,
    endpoint_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl Dht {
    /// Bind a UDP socket (e.g. "0.0.0.0:8080" or "127.0.0.1:0" for an
    /// ephemeral port) and start the node: endpoint task plus refresh loop.
    pub async fn start(bind_addr: &str, config: DhtConfig) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
        let self_id = NodeId::random();
        let routing_table = Arc::new(RoutingTable::new(self_id, config.k));
        let storage = Arc::new(Mutex::new(Storage::new()));

        let (tx, rx_commands) = mpsc::channel(COMMAND_QUEUE);
        let (tx_inbound, rx_inbound) = mpsc::channel(INBOUND_QUEUE);
        transport.spawn_recv_loop(tx_inbound);

        let endpoint = RpcEndpoint::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            rx_inbound,
            Some(rx_commands),
            Arc::clone(&routing_table),
            Arc::clone(&storage),
            config.clone(),
        );
        let node_info = endpoint.my_info();
        let endpoint_task = tokio::spawn(endpoint.run());

        let (stop_tx, stop_rx) = watch::channel(false);
        let refresh_task = tokio::spawn(refresh_loop(
            Arc::clone(&routing_table),
            config.clone(),
            stop_rx,
        ));

        info!(
            "node {} listening on {}",
            node_info.node_id.short_hex(),
            node_info.addr()
        );
        Ok(Self {
            config,
            node_info,
            routing_table,
            storage,
            tx,
            endpoint_task,
            refresh_task,
            stop_tx,
        })
    }

    pub fn node_info(&self) -> PeerInfo {
        self.node_info
    }

    /// Add a peer directly, e.g. from a seed list. The global peer cap is
    /// enforced here; the peer goes in stamped as just seen.
    pub fn add_peer(&self, peer: PeerInfo) -> Result<()> {
        if self.routing_table.peer_count() >= self.config.max_peers {
            return Err(DhtError::PeerLimitExceeded);
        }
        let mut peer = peer;
        peer.touch();
        match self.routing_table.add_peer(peer)? {
            AddOutcome::ProbeLru { lru } => {
                // The bucket wants a liveness verdict; hand the probe to
                // the endpoint task, which owns all network I/O.
                if self.tx.try_send(Command::Probe { peer: lru }).is_err() {
                    trace!("probe request dropped; endpoint queue full");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn get_peer(&self, node_id: NodeId) -> Option<PeerInfo> {
        self.routing_table.find_peer(node_id)
    }

    pub fn find_closest_peers(&self, target: NodeId) -> Vec<PeerInfo> {
        self.routing_table.find_closest(target, self.config.k)
    }

    pub fn peer_count(&self) -> usize {
        self.routing_table.peer_count()
    }

    /// Prune stale peers now, without waiting for the background loop.
    pub fn refresh(&self) {
        self.routing_table.refresh(self.config.stale_threshold);
    }

    /// Join the network through the given seed addresses. Kicks off a
    /// lookup of our own id, which fills the table with nearby peers.
    pub async fn bootstrap(&self, addrs: Vec<SocketAddr>) -> Result<()> {
        self.tx
            .send(Command::Bootstrap { addrs })
            .await
            .map_err(|_| DhtError::NetworkError("endpoint task gone".into()))
    }

    /// Store `value` under `key` on the k closest nodes. Resolves once the
    /// STORE messages have been dispatched (best-effort, not acknowledged).
    pub async fn put(&self, key: Key, value: Value) -> Result<()> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx
            .send(Command::Put {
                key,
                value,
                tx_done,
            })
            .await
            .map_err(|_| DhtError::StorageError("endpoint task gone".into()))?;
        rx_done
            .await
            .map_err(|_| DhtError::StorageError("put abandoned".into()))?
    }

    /// Look `key` up in the network. `Ok(None)` when the lookup converges
    /// without finding a value.
    pub async fn get(&self, key: Key) -> Result<Option<Value>> {
        let (tx_value, rx_value) = oneshot::channel();
        self.tx
            .send(Command::Get { key, tx_value })
            .await
            .map_err(|_| DhtError::NetworkError("endpoint task gone".into()))?;
        rx_value
            .await
            .map_err(|_| DhtError::LookupFailed)?
    }

    /// Does this node currently hold a value for `key` locally?
    pub fn has_value(&self, key: Key) -> bool {
        self.storage
            .lock()
            .expect("storage lock poisoned")
            .contains(&key)
    }

    /// Stop the node: cancel and join the refresh loop, then tear down the
    /// endpoint task.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        let _ = self.refresh_task.await;
        self.endpoint_task.abort();
        let _ = self.endpoint_task.await;
        info!("node {} stopped", self.node_info.node_id.short_hex());
        Ok(())
    }
}

/// Periodically prune stale peers until told to stop. The sleep is a
/// wakeable select arm, so shutdown never waits out a full interval.
async fn refresh_loop(
    routing_table: Arc<RoutingTable>,
    config: DhtConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick of an interval completes immediately; swallow it so
    // the first sweep happens one full period in
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                trace!("refresh sweep");
                routing_table.refresh(config.stale_threshold);
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, SystemTime};

    async fn node(config: DhtConfig) -> Dht {
        Dht::start("127.0.0.1:0", config).await.unwrap()
    }

    fn random_peer(port: u16) -> PeerInfo {
        PeerInfo::new("127.0.0.1".parse().unwrap(), port, NodeId::random())
    }

    #[tokio::test]
    async fn add_and_get_peer() {
        let dht = node(DhtConfig::default()).await;
        let peer = random_peer(8080);
        dht.add_peer(peer).unwrap();
        assert_eq!(dht.peer_count(), 1);

        let got = dht.get_peer(peer.node_id).expect("peer should be present");
        assert_eq!(got.node_id, peer.node_id);
        assert_eq!(got.udp_port, 8080);
        assert!(dht.get_peer(NodeId::random()).is_none());
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn peer_limit_is_enforced() {
        let dht = node(DhtConfig {
            max_peers: 1,
            ..DhtConfig::default()
        })
        .await;

        dht.add_peer(random_peer(8081)).unwrap();
        let err = dht.add_peer(random_peer(8082)).unwrap_err();
        assert!(matches!(err, DhtError::PeerLimitExceeded));
        assert_eq!(dht.peer_count(), 1);
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_peer_is_rejected() {
        let dht = node(DhtConfig::default()).await;
        let err = dht.add_peer(PeerInfo::default()).unwrap_err();
        assert!(matches!(err, DhtError::InvalidPeer));
        assert_eq!(dht.peer_count(), 0);
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn closest_peers_are_sorted_and_capped() {
        let dht = node(DhtConfig::default()).await;
        for i in 0..30 {
            dht.add_peer(random_peer(8000 + i)).unwrap();
        }

        let target = NodeId::random();
        let closest = dht.find_closest_peers(target);
        assert!(!closest.is_empty());
        assert!(closest.len() <= 20);
        for pair in closest.windows(2) {
            assert!(pair[0].node_id.distance(&target) <= pair[1].node_id.distance(&target));
        }
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_drops_peers_past_the_threshold() {
        let dht = node(DhtConfig {
            stale_threshold: Duration::from_secs(1),
            ..DhtConfig::default()
        })
        .await;

        // direct table insert so the old timestamp survives
        let mut peer = random_peer(8090);
        peer.last_seen = SystemTime::now() - Duration::from_secs(5);
        dht.routing_table.add_peer(peer).unwrap();
        assert!(dht.get_peer(peer.node_id).is_some());

        dht.refresh();
        assert!(dht.get_peer(peer.node_id).is_none());
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn added_peers_are_stamped_fresh() {
        let dht = node(DhtConfig::default()).await;
        let mut peer = random_peer(8091);
        peer.last_seen = SystemTime::now() - Duration::from_secs(3600);
        peer.expired = true;
        dht.add_peer(peer).unwrap();

        let got = dht.get_peer(peer.node_id).unwrap();
        assert!(!got.expired);
        assert!(got.last_seen > peer.last_seen);

        // so a refresh right now must keep it
        dht.refresh();
        assert!(dht.get_peer(peer.node_id).is_some());
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_prompt() {
        let dht = node(DhtConfig {
            // a refresh interval far longer than the test
            refresh_interval: Duration::from_secs(3600),
            ..DhtConfig::default()
        })
        .await;

        tokio::time::timeout(Duration::from_secs(1), dht.stop())
            .await
            .expect("stop must not wait out the refresh interval")
            .unwrap();
    }
}
