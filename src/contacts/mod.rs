//! Contact-number protection.
//!
//! Phone numbers are stored encrypted with AES-256-GCM under a process-wide
//! key. The stored form is `<nonce_b64>:<ciphertext_b64>` with a fresh random
//! 96-bit nonce per encryption. Where a number only needs to be compared or
//! logged, [`phone_hash`] gives a stable SHA-256 digest instead.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Errors from encrypting or decrypting a contact number.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is not 32 bytes.
    #[error("phone key must be 32 bytes, got {0}")]
    KeyLength(usize),

    /// A base64 section could not be decoded.
    #[error("invalid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The stored value is not `<nonce>:<ciphertext>`.
    #[error("malformed phone cipher")]
    Malformed,

    /// Authentication failed (wrong key or tampered ciphertext).
    #[error("phone cipher authentication failed")]
    Crypto,

    /// The decrypted bytes are not UTF-8.
    #[error("decrypted phone number is not UTF-8")]
    NotUtf8,
}

/// Result type for cipher operations.
pub type Result<T> = std::result::Result<T, CipherError>;

/// Encrypts and decrypts stored phone numbers.
#[derive(Clone)]
pub struct PhoneCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PhoneCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoneCipher").finish_non_exhaustive()
    }
}

impl PhoneCipher {
    /// Creates a cipher from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(CipherError::KeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength(key.len()))?;
        Ok(PhoneCipher { cipher })
    }

    /// Creates a cipher from a base64-encoded key.
    pub fn from_base64(key: &str) -> Result<Self> {
        Self::new(&BASE64.decode(key.trim())?)
    }

    /// Encrypts `phone` under a fresh nonce.
    pub fn encrypt(&self, phone: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), phone.as_bytes())
            .map_err(|_| CipherError::Crypto)?;
        Ok(format!(
            "{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypts a value produced by [`PhoneCipher::encrypt`].
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let (nonce_b64, ciphertext_b64) = stored.split_once(':').ok_or(CipherError::Malformed)?;
        let nonce = BASE64.decode(nonce_b64)?;
        if nonce.len() != NONCE_LEN {
            return Err(CipherError::Malformed);
        }
        let ciphertext = BASE64.decode(ciphertext_b64)?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CipherError::Crypto)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::NotUtf8)
    }
}

/// Returns the lowercase hex SHA-256 digest of a phone number.
pub fn phone_hash(phone: &str) -> String {
    hex::encode(Sha256::digest(phone.as_bytes()))
}
