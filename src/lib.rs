mod config;
mod core;
mod error;
pub mod dht;
pub mod protocol;
pub mod transport;
mod test_support;

// Re-export commonly used types for consumers and integration tests
pub use crate::config::DhtConfig;
pub use crate::core::identifier::{Distance, Key, NodeId, PeerInfo};
pub use crate::core::routing_table::{AddOutcome, RoutingTable};
pub use crate::core::storage::{Storage, Value};
pub use crate::error::{DhtError, Result};

use ctor::ctor;
use tracing_subscriber::{fmt, EnvFilter};

#[ctor]
fn init_tracing() {
    // Tolerates double-init when tests run in parallel
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .try_init();
}
