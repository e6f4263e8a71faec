//! MeshLink Crypto
//!
//! Symmetric cipher suite shared by the TCP control channel and the UDP
//! peer channel. The suite is selected once from the session configuration
//! and is immutable afterwards; both transports reference the same instance.

pub mod error;
pub mod suite;

pub use error::{CryptoError, CryptoResult};
pub use suite::CryptoSuite;

/// Size of the symmetric key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the AEAD nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the AEAD authentication tag in bytes
pub const TAG_SIZE: usize = 16;
