//! Node identity derivation

use crate::{
    error::{GoingError, Result},
    network::PeerId,
};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Hash an address into a peer id: first 8 bytes of SHA-256, big-endian
pub fn peer_id_for(ip: IpAddr) -> PeerId {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    PeerId::new(u64::from_be_bytes(head))
}

/// Preferred outbound non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket selects a route without sending anything.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Id of this node, derived from its local address
pub fn derive_peer_id() -> Result<PeerId> {
    local_ipv4()
        .map(|ip| peer_id_for(IpAddr::V4(ip)))
        .ok_or_else(|| GoingError::config("no non-loopback IPv4 address to derive a peer id from"))
}

/// A random id, for running several endpoints on one host
pub fn random_peer_id() -> PeerId {
    PeerId::new(rand::random())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_address_same_id() {
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(peer_id_for(ip), peer_id_for(ip));
        assert_ne!(peer_id_for(ip), peer_id_for("192.168.1.2".parse().unwrap()));
    }
}
