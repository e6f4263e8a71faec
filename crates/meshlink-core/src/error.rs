//! Core error types

use thiserror::Error;

/// Engine-level errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Network layer error
    #[error("network error: {0}")]
    Net(#[from] meshlink_net::NetError),

    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(#[from] meshlink_crypto::CryptoError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
