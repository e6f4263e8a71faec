//! Streaming frame codec
//!
//! One codec serves both transports. The TCP reader feeds it a growing
//! buffer that may hold partial or multiple frames; UDP hands it exactly
//! one datagram. Datagrams are self-delimiting but still carry the header,
//! so the decoder stays transport-agnostic and malformed fragments are
//! distinguishable from valid frames.

use meshlink_crypto::CryptoSuite;

use crate::error::CodecError;
use crate::frame::{Frame, FrameKind, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN, VERSION};

/// Serialize, seal and frame a message for the wire.
pub fn encode(frame: &Frame, crypto: &CryptoSuite) -> Result<Vec<u8>, CodecError> {
    let mut payload = match frame {
        Frame::Data(packet) => packet.clone(),
        Frame::Handshake(p) => serde_json::to_vec(p)?,
        Frame::KeepAlive(p) => serde_json::to_vec(p)?,
        Frame::HandshakeReply(p) => serde_json::to_vec(p)?,
        Frame::ProbeIpv6(p) => serde_json::to_vec(p)?,
        Frame::ProbeHolePunch(p) => serde_json::to_vec(p)?,
    };

    crypto
        .encrypt(&mut payload)
        .map_err(|_| CodecError::EncryptionFailed)?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.push(VERSION);
    buf.push(frame.kind() as u8);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode the first frame held in `buf`.
///
/// Returns the frame and the number of bytes consumed; the caller advances
/// its buffer by that amount. [`CodecError::TooShort`] means an incomplete
/// frame: keep the bytes and read more. Every other error is fatal to the
/// stream.
pub fn decode(buf: &[u8], crypto: &CryptoSuite) -> Result<(Frame, usize), CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::TooShort);
    }

    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(CodecError::InvalidMagic(magic));
    }
    if buf[4] != VERSION {
        return Err(CodecError::InvalidVersion(buf[4]));
    }
    let kind = FrameKind::try_from(buf[5])?;

    let payload_len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return Err(CodecError::TooShort);
    }

    let mut payload = buf[HEADER_LEN..total].to_vec();
    crypto
        .decrypt(&mut payload)
        .map_err(|_| CodecError::DecryptionFailed)?;

    let frame = match kind {
        FrameKind::Data => Frame::Data(payload),
        FrameKind::Handshake => Frame::Handshake(serde_json::from_slice(&payload)?),
        FrameKind::KeepAlive => Frame::KeepAlive(serde_json::from_slice(&payload)?),
        FrameKind::HandshakeReply => Frame::HandshakeReply(serde_json::from_slice(&payload)?),
        FrameKind::ProbeIpv6 => Frame::ProbeIpv6(serde_json::from_slice(&payload)?),
        FrameKind::ProbeHolePunch => Frame::ProbeHolePunch(serde_json::from_slice(&payload)?),
    };

    Ok((frame, total))
}
