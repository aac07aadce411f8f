//! Palmesh mesh presence and routing core.
//! Host-driven: no sockets; the host feeds transport events and bytes in and sends through a
//! [`Transport`] it supplies.

pub mod crypto;
pub mod identity;
pub mod protocol;
pub mod roster;
pub mod router;
pub mod seen;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testkit;

pub use crypto::{CryptoError, CryptoProvider};
pub use identity::{Keypair, PublicKey};
pub use protocol::{Message, Packet, PacketType, User, UserWithKey, PROTOCOL_VERSION};
pub use router::{MeshEvent, Router, RoutingError, SendError};
pub use seen::DEFAULT_SEEN_CAPACITY;
pub use transport::{PeerHandle, Transport, TransportError};
pub use wire::{
    decode_frame, decode_packet, encode_frame, encode_packet, DecodeError, EncodeError,
    FrameDecodeError, MAX_PACKET_LEN,
};
