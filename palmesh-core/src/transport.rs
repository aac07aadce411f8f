//! Boundary to the peer transport. The host owns sockets and sessions; the router only sees handles.

use std::fmt;

/// Directly connected peer, as named by the transport. Handles are never reused by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Send primitives the router needs. Implementations must not block: queue and return.
/// Connect/disconnect events are delivered by the host calling the router directly.
pub trait Transport {
    /// Point-to-point delivery to one connected peer.
    fn send(&self, peer: PeerHandle, packet: Vec<u8>) -> Result<(), TransportError>;

    /// Send to every connected peer except `excluding`.
    fn broadcast(&self, packet: &[u8], excluding: Option<PeerHandle>)
        -> Result<(), TransportError>;

    /// Start advertising this node so other devices can connect. Called once the node has joined.
    fn advertise(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0} is not connected")]
    PeerNotFound(PeerHandle),
    #[error("send to {0} failed")]
    SendFailed(PeerHandle),
    #[error("advertising failed: {0}")]
    Advertise(String),
}
