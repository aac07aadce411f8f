//! Palmesh packet types and protocol version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version. Used in discovery beacons and the transport hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// A mesh participant. Created once per node at startup or learned from a packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub id: Uuid,
}

impl User {
    /// New user with a fresh random id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
        }
    }
}

/// User plus the exported form of their public key, as exchanged during presence propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserWithKey {
    pub user: User,
    pub public_key: Vec<u8>,
}

/// Public chat message, or a private one after decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: User,
    pub text: String,
}

/// Private message body; `ciphertext` is opaque to every hop but the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub from: User,
    pub ciphertext: Vec<u8>,
}

/// Roster snapshot sent back to a neighbor that just announced itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagateConnectedUsers {
    pub users: Vec<UserWithKey>,
}

/// Presence announcement. `initial` is only set on the first hop from the joining node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoin {
    pub user: UserWithKey,
    pub initial: bool,
}

/// Flooded public message. `id` lets every node deliver it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: Uuid,
    pub message: Message,
}

/// Users that are no longer reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeave {
    pub users: Vec<User>,
}

/// Unicast message routed hop by hop toward `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub recipient: Uuid,
    pub message: SealedMessage,
}

/// All packets. Encoding is a one-byte [`PacketType`] followed by the payload (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    PropagateConnectedUsers(PropagateConnectedUsers),
    UserJoin(UserJoin),
    BroadcastMessage(BroadcastMessage),
    UserLeave(UserLeave),
    PrivateMessage(PrivateMessage),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::PropagateConnectedUsers(_) => PacketType::PropagateConnectedUsers,
            Packet::UserJoin(_) => PacketType::UserJoin,
            Packet::BroadcastMessage(_) => PacketType::BroadcastMessage,
            Packet::UserLeave(_) => PacketType::UserLeave,
            Packet::PrivateMessage(_) => PacketType::PrivateMessage,
        }
    }
}

/// Wire discriminant. Values are a stable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    PropagateConnectedUsers = 1,
    UserJoin = 2,
    BroadcastMessage = 3,
    UserLeave = 4,
    PrivateMessage = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        match tag {
            1 => Ok(PacketType::PropagateConnectedUsers),
            2 => Ok(PacketType::UserJoin),
            3 => Ok(PacketType::BroadcastMessage),
            4 => Ok(PacketType::UserLeave),
            5 => Ok(PacketType::PrivateMessage),
            other => Err(other),
        }
    }
}
