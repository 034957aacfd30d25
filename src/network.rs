//! Peer identity and addressing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Identifier of a peer in the overlay.
///
/// Derived once per process (see [`crate::identity`]) and not guaranteed to be
/// globally unique: two nodes sharing one local address collide on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Descriptor of a peer: its id and, once resolved, the address it is reachable at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
}

impl Peer {
    pub fn new(id: PeerId, address: SocketAddr) -> Self {
        Self {
            id,
            address: Some(address),
        }
    }

    /// A descriptor naming only the id, used to ask the registry for the address
    pub fn unresolved(id: PeerId) -> Self {
        Self { id, address: None }
    }

    pub fn is_resolved(&self) -> bool {
        self.address.is_some()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}@?", self.id),
        }
    }
}
