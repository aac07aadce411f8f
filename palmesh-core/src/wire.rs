//! Packet envelope (1-byte type + bincode payload) and stream framing (4 bytes LE length + packet).

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Packet, PacketType};

/// Length prefix size for stream framing.
pub const LEN_SIZE: usize = 4;
/// Largest packet accepted or produced, envelope included.
pub const MAX_PACKET_LEN: usize = 1024 * 1024; // 1 MiB

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PACKET_LEN as u64)
}

/// Encode a packet: discriminant byte followed by the variant payload.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let payload = match packet {
        Packet::PropagateConnectedUsers(p) => payload(p)?,
        Packet::UserJoin(p) => payload(p)?,
        Packet::BroadcastMessage(p) => payload(p)?,
        Packet::UserLeave(p) => payload(p)?,
        Packet::PrivateMessage(p) => payload(p)?,
    };
    if payload.len() + 1 > MAX_PACKET_LEN {
        return Err(EncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(packet.packet_type() as u8);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn payload<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    options().serialize(value).map_err(EncodeError::Encode)
}

/// Decode a packet. Unknown discriminants and malformed payloads fail for this packet only.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let (&tag, body) = bytes
        .split_first()
        .ok_or_else(|| DecodeError::Malformed("empty packet".into()))?;
    if bytes.len() > MAX_PACKET_LEN {
        return Err(DecodeError::Malformed("packet too large".into()));
    }
    let packet = match PacketType::try_from(tag).map_err(DecodeError::UnknownType)? {
        PacketType::PropagateConnectedUsers => Packet::PropagateConnectedUsers(body_of(body)?),
        PacketType::UserJoin => Packet::UserJoin(body_of(body)?),
        PacketType::BroadcastMessage => Packet::BroadcastMessage(body_of(body)?),
        PacketType::UserLeave => Packet::UserLeave(body_of(body)?),
        PacketType::PrivateMessage => Packet::PrivateMessage(body_of(body)?),
    };
    Ok(packet)
}

fn body_of<T: DeserializeOwned>(body: &[u8]) -> Result<T, DecodeError> {
    options()
        .deserialize(body)
        .map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Frame an encoded packet for a stream transport: 4 bytes LE length + packet.
pub fn encode_frame(packet: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if packet.len() > MAX_PACKET_LEN {
        return Err(EncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + packet.len());
    out.extend_from_slice(&(packet.len() as u32).to_le_bytes());
    out.extend_from_slice(packet);
    Ok(out)
}

/// Split one frame from the front of `bytes`. Returns the packet bytes and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_PACKET_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error encoding a packet (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("packet too large")]
    TooLarge,
}

/// Error decoding a packet.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Error splitting a frame (need more bytes or too large).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}
