//! Frame definitions for the MeshLink protocol
//!
//! Wire format, identical on TCP and UDP:
//! [Magic: 4 bytes][Version: 1 byte][Kind: 1 byte][Payload length: 2 bytes BE][Payload]
//!
//! Control payloads are AEAD-sealed JSON; `Data` payloads are the sealed
//! raw IP packet.

use crate::error::CodecError;
use crate::payload::{Handshake, HandshakeReply, KeepAlive, Probe};

/// Frame header magic
pub const MAGIC: u32 = 0x9192_9394;

/// Protocol version
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes
pub const HEADER_LEN: usize = 8;

/// Largest sealed payload the u16 length field can carry
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client hello carrying the identity
    Handshake = 1,

    /// Periodic liveness + self-advertisement (both directions)
    KeepAlive = 2,

    /// Raw IP packet
    Data = 3,

    /// Server reply assigning the virtual address and roster
    HandshakeReply = 4,

    /// UDP reachability probe
    ProbeIpv6 = 6,

    /// Reserved hole-punch probe; carried for wire compatibility
    ProbeHolePunch = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::KeepAlive),
            3 => Ok(Self::Data),
            4 => Ok(Self::HandshakeReply),
            6 => Ok(Self::ProbeIpv6),
            7 => Ok(Self::ProbeHolePunch),
            other => Err(CodecError::InvalidKind(other)),
        }
    }
}

/// A decoded MeshLink frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake(Handshake),
    KeepAlive(KeepAlive),
    Data(Vec<u8>),
    HandshakeReply(HandshakeReply),
    ProbeIpv6(Probe),
    ProbeHolePunch(Probe),
}

impl Frame {
    /// Kind tag written into the header
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Handshake(_) => FrameKind::Handshake,
            Frame::KeepAlive(_) => FrameKind::KeepAlive,
            Frame::Data(_) => FrameKind::Data,
            Frame::HandshakeReply(_) => FrameKind::HandshakeReply,
            Frame::ProbeIpv6(_) => FrameKind::ProbeIpv6,
            Frame::ProbeHolePunch(_) => FrameKind::ProbeHolePunch,
        }
    }
}
