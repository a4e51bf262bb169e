use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::core::identifier::{NodeId, PeerInfo};
use crate::core::routing_table::{AddOutcome, RoutingTable};
use crate::core::storage::{Storage, Value};
use crate::error::DhtError;
use crate::transport::Transport;

mod command;
mod lookup;
mod prober;
pub mod wire;

pub use self::command::Command;
use self::lookup::{Lookup, LookupKind, PendingLookup};
use self::prober::Prober;
use self::wire::{PeerEntry, RpcKind, RpcMessage};

/// How often expired probes and lookup queries are swept.
const MAINTENANCE_TICK: Duration = Duration::from_millis(500);

/// A whole lookup is abandoned after this many query timeouts' worth of
/// wall time, even if fresh candidates keep trickling in.
const LOOKUP_DEADLINE_QUERIES: u32 = 10;

/// The side effects that `handle_message` / `handle_command` want the
/// event loop to perform.
///
/// Decoupling dispatch from I/O keeps the routing logic synchronous and
/// directly testable; only `apply_effect` touches the transport.
#[derive(Debug)]
pub(crate) enum Effect {
    Send {
        addr: SocketAddr,
        message: RpcMessage,
    },
    StartProbe {
        peer: PeerInfo,
    },
}

/// The node's RPC endpoint: one task owning all protocol state.
///
/// Inbound datagrams, façade commands, and the maintenance ticker are
/// multiplexed through a single `select!` loop, so probe and lookup state
/// need no locking. The routing table and storage are shared with the
/// façade behind their own locks, which are never held across I/O.
pub struct RpcEndpoint {
    my_info: PeerInfo,
    routing_table: Arc<RoutingTable>,
    storage: Arc<Mutex<Storage>>,
    transport: Arc<dyn Transport>,
    config: DhtConfig,
    rx_inbound: mpsc::Receiver<(RpcMessage, SocketAddr)>,
    rx_commands: Option<mpsc::Receiver<Command>>,
    prober: Prober,
    pending_lookups: HashMap<NodeId, PendingLookup>,
}

impl RpcEndpoint {
    pub fn new(
        transport: Arc<dyn Transport>,
        rx_inbound: mpsc::Receiver<(RpcMessage, SocketAddr)>,
        rx_commands: Option<mpsc::Receiver<Command>>,
        routing_table: Arc<RoutingTable>,
        storage: Arc<Mutex<Storage>>,
        config: DhtConfig,
    ) -> Self {
        let addr = transport.local_addr();
        let my_info = PeerInfo::new(addr.ip(), addr.port(), routing_table.self_id());
        let prober = Prober::new(config.probe_timeout);
        Self {
            my_info,
            routing_table,
            storage,
            transport,
            config,
            rx_inbound,
            rx_commands,
            prober,
            pending_lookups: HashMap::new(),
        }
    }

    pub fn my_info(&self) -> PeerInfo {
        self.my_info
    }

    /// Pre-seed the routing table, e.g. with statically known peers.
    pub fn add_known_peer(&self, peer: PeerInfo) {
        let _ = self
            .routing_table
            .add_peer_bounded(peer, self.config.max_peers);
    }

    /// Offer a freshly observed contact to the routing table. This is how
    /// the table learns of live peers passively; a full bucket turns into
    /// a probe of its least-recently-seen entry.
    fn observe_contact(&mut self, src_addr: SocketAddr, node_id: NodeId) -> Option<Effect> {
        if node_id == self.my_info.node_id {
            return None;
        }
        let peer = PeerInfo::new(src_addr.ip(), src_addr.port(), node_id);
        match self
            .routing_table
            .add_peer_bounded(peer, self.config.max_peers)
        {
            Ok(AddOutcome::ProbeLru { lru }) => Some(Effect::StartProbe { peer: lru }),
            Ok(_) => None,
            Err(e) => {
                trace!("not adding {}: {e}", node_id.short_hex());
                None
            }
        }
    }

    fn handle_message(&mut self, msg: RpcMessage, src_addr: SocketAddr) -> Vec<Effect> {
        let mut effects = Vec::new();

        // Passive learning happens before dispatch: every well-formed
        // message proves its sender reachable.
        if let Some(effect) = self.observe_contact(src_addr, msg.sender) {
            effects.push(effect);
        }

        match msg.kind {
            RpcKind::Ping => {
                if let Some(probe) = self.prober.complete(msg.sender) {
                    // Answer to our probe; do not pong a pong.
                    self.routing_table.resolve_probe(probe.peer, true);
                } else {
                    trace!("ping from {}", msg.sender.short_hex());
                    effects.push(Effect::Send {
                        addr: src_addr,
                        message: RpcMessage::ping(self.my_info.node_id, msg.sender),
                    });
                }
            }

            RpcKind::Store => match msg.value {
                Some(value) => {
                    trace!(
                        "storing {} bytes under {}",
                        value.len(),
                        msg.target.short_hex()
                    );
                    self.storage
                        .lock()
                        .expect("storage lock poisoned")
                        .insert(msg.target, value);
                }
                None => warn!("STORE without a value from {src_addr}"),
            },

            RpcKind::FindNode => match msg.closest_nodes {
                Some(entries) => {
                    self.handle_nodes_reply(msg.sender, msg.target, entries, &mut effects)
                }
                None => {
                    let closest = self.routing_table.find_closest(msg.target, self.config.k);
                    effects.push(Effect::Send {
                        addr: src_addr,
                        message: RpcMessage::nodes_reply(
                            RpcKind::FindNode,
                            self.my_info.node_id,
                            msg.target,
                            &closest,
                        ),
                    });
                }
            },

            RpcKind::FindValue => {
                if let Some(value) = msg.value {
                    self.complete_value_lookup(msg.target, value);
                } else if let Some(entries) = msg.closest_nodes {
                    self.handle_nodes_reply(msg.sender, msg.target, entries, &mut effects);
                } else {
                    let stored = self
                        .storage
                        .lock()
                        .expect("storage lock poisoned")
                        .get(&msg.target)
                        .cloned();
                    let reply = match stored {
                        Some(value) => {
                            RpcMessage::value_reply(self.my_info.node_id, msg.target, value)
                        }
                        None => {
                            let closest =
                                self.routing_table.find_closest(msg.target, self.config.k);
                            RpcMessage::nodes_reply(
                                RpcKind::FindValue,
                                self.my_info.node_id,
                                msg.target,
                                &closest,
                            )
                        }
                    };
                    effects.push(Effect::Send {
                        addr: src_addr,
                        message: reply,
                    });
                }
            }
        }

        effects
    }

    /// A node-bearing reply: learn about the reported peers and advance
    /// the lookup it belongs to, if any.
    fn handle_nodes_reply(
        &mut self,
        responder: NodeId,
        target: NodeId,
        entries: Vec<PeerEntry>,
        effects: &mut Vec<Effect>,
    ) {
        let my_id = self.my_info.node_id;
        let peers: Vec<PeerInfo> = entries
            .iter()
            .filter(|e| e.node_id != my_id)
            .map(|e| e.to_peer())
            .collect();

        for peer in &peers {
            if let Some(effect) = self.observe_contact(peer.addr(), peer.node_id) {
                effects.push(effect);
            }
        }

        let finished = match self.pending_lookups.get_mut(&target) {
            Some(pending) => {
                pending.lookup.on_reply(responder, peers);
                effects.extend(pending.lookup.top_up());
                pending.lookup.is_finished()
            }
            None => {
                trace!(
                    "nodes reply for unknown lookup target {}",
                    target.short_hex()
                );
                false
            }
        };
        if finished {
            self.finalize_lookup(target, effects);
        }
    }

    /// A value-bearing FIND_VALUE reply terminates the lookup immediately.
    fn complete_value_lookup(&mut self, key: NodeId, value: Value) {
        if let Some(mut pending) = self.pending_lookups.remove(&key) {
            debug!("lookup for {} found a value", key.short_hex());
            if let Some(tx) = pending.tx_value.take() {
                let _ = tx.send(Ok(Some(value.clone())));
            }
        }
        // Cache it so nearby requests can be served from here.
        self.storage
            .lock()
            .expect("storage lock poisoned")
            .insert(key, value);
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Get { key, tx_value } => {
                self.start_lookup(key, LookupKind::Value, None, None, Some(tx_value))
            }
            Command::Put {
                key,
                value,
                tx_done,
            } => self.start_lookup(key, LookupKind::Node, Some(value), Some(tx_done), None),
            Command::Bootstrap { addrs } => {
                // A self-lookup, seeded by asking the seed addresses
                // directly; their replies populate the routing table with
                // peers close to us.
                let my_id = self.my_info.node_id;
                let mut effects =
                    self.init_lookup(my_id, LookupKind::Node, Vec::new(), None, None, None);
                for addr in addrs {
                    effects.push(Effect::Send {
                        addr,
                        message: RpcMessage::find_node(my_id, my_id),
                    });
                }
                effects
            }
            Command::Probe { peer } => vec![Effect::StartProbe { peer }],
            Command::DebugHasValue { key, tx_has } => {
                let has = self
                    .storage
                    .lock()
                    .expect("storage lock poisoned")
                    .contains(&key);
                let _ = tx_has.send(has);
                Vec::new()
            }
        }
    }

    fn start_lookup(
        &mut self,
        key: NodeId,
        kind: LookupKind,
        put_value: Option<Value>,
        tx_done: Option<tokio::sync::oneshot::Sender<Result<(), DhtError>>>,
        tx_value: Option<tokio::sync::oneshot::Sender<Result<Option<Value>, DhtError>>>,
    ) -> Vec<Effect> {
        let initial = self.routing_table.find_closest(key, self.config.k);
        let mut effects = self.init_lookup(key, kind, initial, put_value, tx_done, tx_value);
        // An empty routing table finishes (and fails) on the spot.
        if self
            .pending_lookups
            .get(&key)
            .map_or(false, |p| p.lookup.is_finished())
        {
            self.finalize_lookup(key, &mut effects);
        }
        effects
    }

    fn init_lookup(
        &mut self,
        target: NodeId,
        kind: LookupKind,
        initial: Vec<PeerInfo>,
        put_value: Option<Value>,
        tx_done: Option<tokio::sync::oneshot::Sender<Result<(), DhtError>>>,
        tx_value: Option<tokio::sync::oneshot::Sender<Result<Option<Value>, DhtError>>>,
    ) -> Vec<Effect> {
        let mut lookup = Lookup::new(
            self.config.k,
            self.config.alpha,
            self.my_info.node_id,
            target,
            kind,
            self.config.query_timeout,
            initial,
        );
        let effects = lookup.top_up();
        let deadline = Instant::now() + self.config.query_timeout * LOOKUP_DEADLINE_QUERIES;
        self.pending_lookups.insert(
            target,
            PendingLookup {
                lookup,
                deadline,
                put_value,
                tx_done,
                tx_value,
            },
        );
        effects
    }

    /// Resolve a finished (or abandoned) lookup: dispatch STOREs for a
    /// Put, and complete whichever caller channel is attached.
    fn finalize_lookup(&mut self, target: NodeId, effects: &mut Vec<Effect>) {
        let Some(mut pending) = self.pending_lookups.remove(&target) else {
            return;
        };
        let failed = pending.lookup.failed();
        let results = pending.lookup.results();

        if let Some(value) = pending.put_value.take() {
            if results.is_empty() {
                if let Some(tx) = pending.tx_done.take() {
                    let _ = tx.send(Err(DhtError::LookupFailed));
                }
                return;
            }
            debug!(
                "replicating {} to {} peers",
                target.short_hex(),
                results.len()
            );
            for peer in &results {
                effects.push(Effect::Send {
                    addr: peer.addr(),
                    message: RpcMessage::store(self.my_info.node_id, target, value.clone()),
                });
            }
            if let Some(tx) = pending.tx_done.take() {
                let _ = tx.send(Ok(()));
            }
        } else if let Some(tx) = pending.tx_value.take() {
            // A value lookup that converged without finding the value.
            let _ = tx.send(if failed {
                Err(DhtError::LookupFailed)
            } else {
                Ok(None)
            });
        } else if let Some(tx) = pending.tx_done.take() {
            let _ = tx.send(if failed {
                Err(DhtError::LookupFailed)
            } else {
                Ok(())
            });
        }
    }

    /// Commit expired probes, expire lookup queries, and top lookups back
    /// up. Runs on every maintenance tick.
    fn sweep_timeouts_and_topup(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        for probe in self.prober.sweep(now) {
            debug!("probe of {} timed out", probe.peer.node_id.short_hex());
            self.routing_table.resolve_probe(probe.peer, false);
        }

        let targets: Vec<NodeId> = self.pending_lookups.keys().copied().collect();
        for target in targets {
            let Some(pending) = self.pending_lookups.get_mut(&target) else {
                continue;
            };
            let expired = pending.lookup.sweep_expired(now);
            let lookup_effects = pending.lookup.top_up();
            let done = pending.lookup.is_finished() || pending.deadline <= now;

            for node_id in expired {
                debug!("lookup query to {} timed out", node_id.short_hex());
                self.routing_table.remove_peer(node_id);
            }
            effects.extend(lookup_effects);
            if done {
                self.finalize_lookup(target, &mut effects);
            }
        }
        effects
    }

    async fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Send { addr, message } => {
                if let Err(e) = self.transport.send(addr, &message).await {
                    warn!("failed to send to {addr}: {e}");
                }
            }
            Effect::StartProbe { peer } => {
                if !self.prober.begin(peer) {
                    return;
                }
                let ping = RpcMessage::ping(self.my_info.node_id, peer.node_id);
                if let Err(e) = self.transport.send(peer.addr(), &ping).await {
                    warn!("failed to probe {}: {e}", peer.node_id.short_hex());
                    self.prober.complete(peer.node_id);
                    self.routing_table.resolve_probe(peer, false);
                }
            }
        }
    }

    /// Service messages, commands, and maintenance until the transport
    /// channel closes.
    pub async fn run(mut self) {
        let mut ticker = interval(MAINTENANCE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                inbound = self.rx_inbound.recv() => {
                    match inbound {
                        Some((message, src_addr)) => {
                            let effects = self.handle_message(message, src_addr);
                            for effect in effects {
                                self.apply_effect(effect).await;
                            }
                        }
                        None => {
                            info!("transport channel closed; endpoint shutting down");
                            break;
                        }
                    }
                }

                maybe_command = async {
                    match self.rx_commands.as_mut() {
                        Some(rx) => rx.recv().await,
                        // effectively disables this select arm
                        None => std::future::pending::<Option<Command>>().await,
                    }
                } => {
                    match maybe_command {
                        Some(command) => {
                            let effects = self.handle_command(command);
                            for effect in effects {
                                self.apply_effect(effect).await;
                            }
                        }
                        None => {
                            // Command channel closed; continue headless.
                            self.rx_commands = None;
                        }
                    }
                }

                _ = ticker.tick() => {
                    let effects = self.sweep_timeouts_and_topup(Instant::now());
                    for effect in effects {
                        self.apply_effect(effect).await;
                    }
                }
            }
        }
    }
}
