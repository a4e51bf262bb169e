use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::ops::BitXor;
use std::time::{Duration, SystemTime};

use ethereum_types::H160;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::DhtError;

pub const ID_BYTES: usize = 20;
pub const ID_BITS: usize = 160;

const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// A 160-bit node identifier. Doubles as the key space for stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub H160);

pub type Key = NodeId;

impl NodeId {
    /// Draw a fresh identifier uniformly from the full 2^160 space.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::rng().fill(&mut bytes[..]);
        NodeId(H160::from(bytes))
    }

    pub fn zero() -> Self {
        NodeId(H160::zero())
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        NodeId(H160::from(bytes))
    }

    /// Derive an id from arbitrary content, e.g. to key a stored value.
    pub fn from_hashed<S: AsRef<[u8]>>(input: &S) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(input.as_ref());
        let digest = hasher.finalize();
        NodeId(H160::from_slice(&digest))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> Distance {
        Distance(self.0 ^ other.0)
    }

    /// Index of the most significant bit at which the two ids differ,
    /// in `[0, 159]`. Equal ids collapse to 0, which is why a node must
    /// never file a peer under its own id.
    pub fn log_distance(&self, other: &NodeId) -> usize {
        let xor = self.0 ^ other.0;
        for (i, byte) in xor.as_bytes().iter().enumerate() {
            if *byte != 0 {
                return (ID_BYTES - i - 1) * 8 + (7 - byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// FNV-1a over the 20 id bytes. Stable across processes, unlike the
    /// std hasher's randomized state.
    pub fn stable_hash(&self) -> u64 {
        let mut acc = FNV_OFFSET_BASIS;
        for byte in self.0.as_bytes() {
            acc ^= u64::from(*byte);
            acc = acc.wrapping_mul(FNV_PRIME);
        }
        acc
    }

    /// 40 lowercase hex characters, big-endian: the wire encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(s).map_err(|_| DhtError::InvalidPeer)?;
        if bytes.len() != ID_BYTES {
            return Err(DhtError::InvalidPeer);
        }
        Ok(NodeId(H160::from_slice(&bytes)))
    }

    /// Short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.0.to_fixed_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[16], b[17], b[18], b[19]
        )
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: Self) -> Self::Output {
        NodeId(self.0 ^ rhs.0)
    }
}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.stable_hash());
    }
}

// Ids travel as bare hex strings in every message field that carries one.
impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(|_| serde::de::Error::custom("expected 40 hex characters"))
    }
}

/// XOR distance interpreted as an unsigned 160-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(H160);

impl Distance {
    pub fn zero() -> Self {
        Distance(H160::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

/// A peer as tracked by the routing table.
///
/// `node_id` is fixed for the peer's lifetime; `last_seen` is refreshed on
/// every observation and drives staleness eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerInfo {
    pub ip_address: IpAddr,
    pub udp_port: u16,
    pub node_id: NodeId,
    pub last_seen: SystemTime,
    pub expired: bool,
}

impl PeerInfo {
    /// A freshly observed peer: `last_seen` stamped now, not expired.
    pub fn new(ip_address: IpAddr, udp_port: u16, node_id: NodeId) -> Self {
        Self {
            ip_address,
            udp_port,
            node_id,
            last_seen: SystemTime::now(),
            expired: false,
        }
    }

    /// Routable peers have a usable port and a real id.
    pub fn is_valid(&self) -> bool {
        self.udp_port >= 1 && self.node_id != NodeId::zero()
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.udp_port)
    }

    pub fn touch(&mut self) {
        self.last_seen = SystemTime::now();
        self.expired = false;
    }

    pub fn is_stale(&self, threshold: Duration, now: SystemTime) -> bool {
        now.duration_since(self.last_seen)
            .map_or(false, |age| age >= threshold)
    }
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self {
            ip_address: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            udp_port: 0,
            node_id: NodeId::zero(),
            last_seen: SystemTime::UNIX_EPOCH,
            expired: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::id_with_first_byte;

    fn id_from(bytes: [u8; ID_BYTES]) -> NodeId {
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = NodeId::random();
        assert_eq!(a.distance(&a), Distance::zero());
        assert_eq!(a.log_distance(&a), 0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn xor_triangle_identity() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        // d(a,b) ^ d(b,c) == d(a,c)
        assert_eq!((a ^ b) ^ (b ^ c), a ^ c);
    }

    #[test]
    fn log_distance_of_top_byte_difference() {
        let a = id_with_first_byte(1);
        let b = id_with_first_byte(2);
        // top byte XOR is 0b11, so the highest differing bit is 153
        assert_eq!(a.log_distance(&b), 153);
        assert_eq!(b.log_distance(&a), 153);
    }

    #[test]
    fn log_distance_of_low_bit_difference() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[19] = 1;
        let a = id_from(bytes);
        assert_eq!(NodeId::zero().log_distance(&a), 0);
        bytes[19] = 2;
        let b = id_from(bytes);
        assert_eq!(NodeId::zero().log_distance(&b), 1);
    }

    #[test]
    fn stable_hash_is_deterministic_and_spreads() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.stable_hash(), a.stable_hash());
        assert_ne!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn hex_round_trip() {
        let a = NodeId::random();
        let hex = a.to_hex();
        assert_eq!(hex.len(), 40);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(NodeId::from_hex(&hex).unwrap(), a);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(NodeId::from_hex("not hex").is_err());
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"0".repeat(42)).is_err());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn default_peer_is_invalid() {
        assert!(!PeerInfo::default().is_valid());
    }

    #[test]
    fn zero_id_or_zero_port_is_invalid() {
        let mut peer = PeerInfo::new("127.0.0.1".parse().unwrap(), 4000, NodeId::random());
        assert!(peer.is_valid());
        peer.udp_port = 0;
        assert!(!peer.is_valid());
        peer.udp_port = 4000;
        peer.node_id = NodeId::zero();
        assert!(!peer.is_valid());
    }

    #[test]
    fn staleness_is_age_based() {
        let mut peer = PeerInfo::new("127.0.0.1".parse().unwrap(), 4000, NodeId::random());
        let now = SystemTime::now();
        peer.last_seen = now - Duration::from_secs(5);
        assert!(peer.is_stale(Duration::from_secs(1), now));
        assert!(!peer.is_stale(Duration::from_secs(10), now));
        // zero threshold marks everything stale
        peer.last_seen = now;
        assert!(peer.is_stale(Duration::ZERO, now));
    }
}
