use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::core::identifier::{NodeId, PeerInfo};
use crate::core::storage::Value;

/// RPC verbs, numbered as they travel in the wire `type` field.
///
/// Replies reuse the request's verb: a PING reply is a PING addressed back
/// at the original sender, a FIND_NODE reply is a FIND_NODE carrying
/// `closestNodes`, and a FIND_VALUE reply carries either `value` or
/// `closestNodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RpcKind {
    Ping = 0,
    Store = 1,
    FindNode = 2,
    FindValue = 3,
}

impl From<RpcKind> for u8 {
    fn from(kind: RpcKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for RpcKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RpcKind::Ping),
            1 => Ok(RpcKind::Store),
            2 => Ok(RpcKind::FindNode),
            3 => Ok(RpcKind::FindValue),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

/// Contact info as carried inside `closestNodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    #[serde(with = "serde_ipaddr")]
    pub ip: IpAddr,
    pub port: u16,
    pub node_id: NodeId,
}

impl From<&PeerInfo> for PeerEntry {
    fn from(peer: &PeerInfo) -> Self {
        Self {
            ip: peer.ip_address,
            port: peer.udp_port,
            node_id: peer.node_id,
        }
    }
}

impl PeerEntry {
    /// Reconstruct a live peer record, stamped as seen now.
    pub fn to_peer(&self) -> PeerInfo {
        PeerInfo::new(self.ip, self.port, self.node_id)
    }
}

/// One UDP datagram. Node ids are 40 lowercase hex characters, big-endian;
/// the optional value is hex so arbitrary bytes survive the JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    #[serde(rename = "type")]
    pub kind: RpcKind,
    pub sender: NodeId,
    pub target: NodeId,
    #[serde(default, with = "serde_hex_value", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closest_nodes: Option<Vec<PeerEntry>>,
}

impl RpcMessage {
    /// A PING request, or equally the reply to one (target = the pinger).
    pub fn ping(sender: NodeId, target: NodeId) -> Self {
        Self {
            kind: RpcKind::Ping,
            sender,
            target,
            value: None,
            closest_nodes: None,
        }
    }

    /// Best-effort STORE of `value` under `key`; never answered.
    pub fn store(sender: NodeId, key: NodeId, value: Value) -> Self {
        Self {
            kind: RpcKind::Store,
            sender,
            target: key,
            value: Some(value),
            closest_nodes: None,
        }
    }

    pub fn find_node(sender: NodeId, target: NodeId) -> Self {
        Self {
            kind: RpcKind::FindNode,
            sender,
            target,
            value: None,
            closest_nodes: None,
        }
    }

    pub fn find_value(sender: NodeId, key: NodeId) -> Self {
        Self {
            kind: RpcKind::FindValue,
            sender,
            target: key,
            value: None,
            closest_nodes: None,
        }
    }

    /// A node-bearing reply: FIND_NODE or FIND_VALUE echoing the target
    /// with the responder's closest known peers.
    pub fn nodes_reply(kind: RpcKind, sender: NodeId, target: NodeId, peers: &[PeerInfo]) -> Self {
        Self {
            kind,
            sender,
            target,
            value: None,
            closest_nodes: Some(peers.iter().map(PeerEntry::from).collect()),
        }
    }

    /// A value-bearing FIND_VALUE reply.
    pub fn value_reply(sender: NodeId, key: NodeId, value: Value) -> Self {
        Self {
            kind: RpcKind::FindValue,
            sender,
            target: key,
            value: Some(value),
            closest_nodes: None,
        }
    }

    /// Requests carry neither a value nor a node list; replies carry one
    /// of the two.
    pub fn is_reply(&self) -> bool {
        self.value.is_some() || self.closest_nodes.is_some()
    }
}

mod serde_ipaddr {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::IpAddr;

    pub fn serialize<S>(ip: &IpAddr, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&ip.to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<IpAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod serde_hex_value {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::core::storage::Value;

    pub fn serialize<S>(value: &Option<Value>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str = Option::<String>::deserialize(d)?;
        hex_str
            .map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
