use thiserror::Error;

pub type Result<T, E = DhtError> = std::result::Result<T, E>;

/// Errors surfaced by the DHT core.
///
/// Transport-level failures inside a lookup are retried via other peers and
/// never reach the caller; what does surface is validation, capacity, and
/// terminal lookup failure.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("invalid peer")]
    InvalidPeer,
    #[error("peer not found")]
    PeerNotFound,
    #[error("peer limit exceeded")]
    PeerLimitExceeded,
    #[error("stale data")]
    StaleData,
    #[error("network: {0}")]
    NetworkError(String),
    #[error("ping failed")]
    PingFailure,
    #[error("storage: {0}")]
    StorageError(String),
    #[error("lookup failed")]
    LookupFailed,
}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
