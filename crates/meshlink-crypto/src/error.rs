//! Crypto error types

use thiserror::Error;

/// Cipher suite errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Unknown algorithm name in the crypto config
    #[error("unknown crypto algorithm: {0}")]
    UnknownAlgorithm(String),

    /// The xor suite needs at least one key byte
    #[error("xor suite requires a non-empty key")]
    EmptyKey,

    /// Encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption or authentication failed
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
