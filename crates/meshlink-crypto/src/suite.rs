//! Cipher suite selection and sealed-box encoding
//!
//! A suite is built once from the configuration string `"<alg>:<key>"` and
//! then applied to every frame payload on both transports. The AEAD suites
//! use the combined encoding `nonce(12) || ciphertext || tag(16)` so a
//! payload is self-contained on the wire.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{consts::U12, generic_array::GenericArray, Aead, AeadCore, KeyInit},
    ChaCha20Poly1305,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A derived 256-bit suite key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SuiteKey([u8; KEY_SIZE]);

impl SuiteKey {
    /// Derive a key as SHA-256 of the UTF-8 configuration string
    fn derive(config_key: &str) -> Self {
        let digest = Sha256::digest(config_key.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

/// The symmetric transform applied to every frame payload
#[derive(Clone)]
pub enum CryptoSuite {
    /// ChaCha20-Poly1305 AEAD with a random 96-bit nonce per payload
    ChaCha20Poly1305(SuiteKey),
    /// AES-256-GCM AEAD with a random 96-bit nonce per payload
    Aes256Gcm(SuiteKey),
    /// Repeating-key XOR keystream; no integrity protection
    Xor(Vec<u8>),
    /// Identity transform
    Plain,
}

impl CryptoSuite {
    /// Build a suite from a configuration string `"<alg>:<key>"`.
    ///
    /// Accepted algorithm names are `chacha20`/`chacha20poly1305`,
    /// `aes256`/`aes256gcm` and `xor`; an empty config selects the plain
    /// suite. The AEADs key themselves with SHA-256 of the key string;
    /// `xor` uses the raw key bytes.
    pub fn from_config(config: &str) -> CryptoResult<Self> {
        let config = config.trim();
        if config.is_empty() {
            return Ok(Self::Plain);
        }

        let (alg, key) = match config.split_once(':') {
            Some((alg, key)) => (alg, key),
            None => (config, ""),
        };

        match alg.to_ascii_lowercase().as_str() {
            "chacha20" | "chacha20poly1305" => {
                Ok(Self::ChaCha20Poly1305(SuiteKey::derive(key)))
            }
            "aes256" | "aes256gcm" => Ok(Self::Aes256Gcm(SuiteKey::derive(key))),
            "xor" => {
                if key.is_empty() {
                    Err(CryptoError::EmptyKey)
                } else {
                    Ok(Self::Xor(key.as_bytes().to_vec()))
                }
            }
            other => Err(CryptoError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305(_) => "chacha20poly1305",
            Self::Aes256Gcm(_) => "aes256gcm",
            Self::Xor(_) => "xor",
            Self::Plain => "plain",
        }
    }

    /// Encrypt a payload in place.
    ///
    /// For the AEAD suites the buffer is replaced with the combined
    /// encoding; `xor` and `plain` keep the length unchanged.
    pub fn encrypt(&self, buf: &mut Vec<u8>) -> CryptoResult<()> {
        match self {
            Self::ChaCha20Poly1305(key) => seal::<ChaCha20Poly1305>(key, buf),
            Self::Aes256Gcm(key) => seal::<Aes256Gcm>(key, buf),
            Self::Xor(key) => {
                xor_in_place(key, buf);
                Ok(())
            }
            Self::Plain => Ok(()),
        }
    }

    /// Decrypt a payload in place; the inverse of [`encrypt`](Self::encrypt).
    ///
    /// AEAD tag verification failures surface as
    /// [`CryptoError::DecryptionFailed`].
    pub fn decrypt(&self, buf: &mut Vec<u8>) -> CryptoResult<()> {
        match self {
            Self::ChaCha20Poly1305(key) => open::<ChaCha20Poly1305>(key, buf),
            Self::Aes256Gcm(key) => open::<Aes256Gcm>(key, buf),
            Self::Xor(key) => {
                xor_in_place(key, buf);
                Ok(())
            }
            Self::Plain => Ok(()),
        }
    }

}

impl std::fmt::Debug for CryptoSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in debug output
        f.write_str(self.name())
    }
}

fn seal<C>(key: &SuiteKey, buf: &mut Vec<u8>) -> CryptoResult<()>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let cipher = C::new_from_slice(&key.0).map_err(|_| CryptoError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, buf.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    buf.clear();
    buf.reserve(NONCE_SIZE + ciphertext.len());
    buf.extend_from_slice(&nonce_bytes);
    buf.extend_from_slice(&ciphertext);
    Ok(())
}

fn open<C>(key: &SuiteKey, buf: &mut Vec<u8>) -> CryptoResult<()>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    if buf.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = C::new_from_slice(&key.0).map_err(|_| CryptoError::DecryptionFailed)?;

    let nonce = GenericArray::from_slice(&buf[..NONCE_SIZE]);
    let plaintext = cipher
        .decrypt(nonce, &buf[NONCE_SIZE..])
        .map_err(|_| CryptoError::DecryptionFailed)?;

    *buf = plaintext;
    Ok(())
}

fn xor_in_place(key: &[u8], buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}
