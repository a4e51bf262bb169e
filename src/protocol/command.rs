use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::core::identifier::{Key, PeerInfo};
use crate::core::storage::Value;
use crate::error::DhtError;

/// Commands are the user-facing API into the `RpcEndpoint` event loop.
///
/// The `Dht` façade holds an `mpsc::Sender<Command>` and sends requests
/// into the single endpoint task. All socket I/O, probe state, and lookup
/// state are owned and serialized by that loop, avoiding out-of-band
/// mutations; only the routing table and storage are shared, behind their
/// own locks.
pub enum Command {
    /// Start a value lookup for `key`. The oneshot completes with
    /// `Ok(Some(value))` when any node returns the value, `Ok(None)` when
    /// the lookup converges without one, and `Err(LookupFailed)` when no
    /// peer responded at all.
    Get {
        key: Key,
        tx_value: oneshot::Sender<Result<Option<Value>, DhtError>>,
    },
    /// Store `value` under `key`: a node lookup for the k closest peers
    /// followed by best-effort STORE messages to them. The oneshot
    /// completes once the STOREs have been dispatched (not delivered).
    Put {
        key: Key,
        value: Value,
        tx_done: oneshot::Sender<Result<(), DhtError>>,
    },
    /// Join the network: send `FIND_NODE(self)` to the seed addresses and
    /// run the resulting self-lookup to populate the routing table.
    Bootstrap { addrs: Vec<SocketAddr> },
    /// Probe a peer the routing table wants a liveness verdict on; issued
    /// by the façade when one of its direct inserts hit a full bucket.
    Probe { peer: PeerInfo },
    /// Test/debug helper: does this node currently hold a value for `key`?
    DebugHasValue {
        key: Key,
        tx_has: oneshot::Sender<bool>,
    },
}
