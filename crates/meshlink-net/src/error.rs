//! Network error types

use thiserror::Error;

/// Frame codec errors.
///
/// `TooShort` is the only non-fatal kind: the caller keeps its buffer and
/// resumes once more bytes arrive. Every other kind poisons the stream and
/// must close the containing session.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not enough bytes for a complete frame yet
    #[error("buffer too short for a complete frame")]
    TooShort,

    /// Header magic mismatch
    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    /// Unsupported protocol version
    #[error("invalid version: {0}")]
    InvalidVersion(u8),

    /// Frame kind outside the defined set
    #[error("invalid frame kind: {0}")]
    InvalidKind(u8),

    /// Payload failed authentication or decryption
    #[error("payload decryption failed")]
    DecryptionFailed,

    /// Control payload is not the expected JSON object
    #[error("payload deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Payload encryption failed
    #[error("payload encryption failed")]
    EncryptionFailed,

    /// Sealed payload exceeds the u16 length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl CodecError {
    /// Whether this error poisons the byte stream it was decoded from
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::TooShort)
    }
}

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// TCP connect to the server failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Handshake could not be completed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Session saw no traffic within the inactivity window
    #[error("session timed out")]
    Timeout,

    /// Operation requires a connected session
    #[error("not connected")]
    NotConnected,

    /// The session or supervisor has been shut down
    #[error("closed")]
    Closed,

    /// Malformed address input
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_too_short_is_retryable() {
        assert!(!CodecError::TooShort.is_fatal());
        assert!(CodecError::InvalidMagic(0).is_fatal());
        assert!(CodecError::InvalidVersion(9).is_fatal());
        assert!(CodecError::InvalidKind(5).is_fatal());
        assert!(CodecError::DecryptionFailed.is_fatal());
    }
}
