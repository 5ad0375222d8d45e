//! Session encryption primitive
//!
//! XChaCha20-Poly1305 with a random 24-byte nonce prepended to the
//! ciphertext and the 16-byte authentication tag appended to it:
//!
//! ```text
//! [ nonce (24) | ciphertext (len(message)) | tag (16) ]
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use thiserror::Error;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Session key length in bytes
pub const KEY_LEN: usize = 32;

/// Errors from the encryption primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("missing or malformed session key")]
    MissingKey,

    #[error("refusing to encrypt an empty message")]
    EmptyMessage,

    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("authentication failed")]
    Authentication,
}

/// Symmetric key shared by a worker and the master for one session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Build a key from derived key material
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::MissingKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(message, &self.0)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(ciphertext, &self.0)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::MissingKey);
    }
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::MissingKey)
}

/// Encrypt and authenticate `message` under `key`
pub fn encrypt(message: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    if message.is_empty() {
        return Err(CryptoError::EmptyMessage);
    }

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), message)
        .map_err(|_| CryptoError::Authentication)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Verify and decrypt a ciphertext produced by [`encrypt`]
pub fn decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort(ciphertext.len()));
    }

    let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Authentication)
}
