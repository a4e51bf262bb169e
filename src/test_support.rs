#[cfg(test)]
pub mod test_support {
    use crate::core::identifier::{NodeId, PeerInfo};
    use ethereum_types::H160;
    use std::net::{IpAddr, Ipv4Addr};

    /// An id whose bucket placement is easy to reason about: only the
    /// first byte is set.
    pub fn id_with_first_byte(b: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = b;
        NodeId(H160::from(id))
    }

    pub fn make_peer(last_octet: u8, port: u16, first_byte: u8) -> PeerInfo {
        PeerInfo::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet)),
            port,
            id_with_first_byte(first_byte),
        )
    }
}
