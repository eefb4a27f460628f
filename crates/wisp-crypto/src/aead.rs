//! Precomputed box keys with `XChaCha20-Poly1305`.
//!
//! A [`SharedKey`] is either the result of an X25519 agreement between a
//! secret and a public key (run through a BLAKE3 KDF), or a random symmetric
//! key owned by one node (cookie and return-path secrets).
//!
//! Ciphertext layout is `ciphertext || tag`; the nonce is carried separately
//! by every packet format.

use crate::keys::{PublicKey, SecretKey};
use crate::nonce::Nonce;
use crate::{CryptoError, MAC_SIZE, SHARED_KEY_SIZE};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// KDF context for box keys derived from X25519
const BOX_KDF_CONTEXT: &str = "wisp 2024 box key v1";

/// Symmetric key for authenticated encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_SIZE]);

impl SharedKey {
    /// Precompute the box key between our secret and a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the peer key is a
    /// low-order point (the agreement would be all zeros).
    pub fn precompute(secret: &SecretKey, public: &PublicKey) -> Result<Self, CryptoError> {
        let peer = x25519_dalek::PublicKey::from(public.to_bytes());
        let shared = secret.0.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Self(blake3::derive_key(BOX_KDF_CONTEXT, shared.as_bytes())))
    }

    /// Generate a random symmetric key
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; SHARED_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap raw key bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SHARED_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Encrypt and authenticate `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the plaintext exceeds the
    /// cipher's length limit.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Verify and decrypt `ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on a tag mismatch or a
    /// ciphertext shorter than the tag.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MAC_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        self.cipher()
            .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey([REDACTED])")
    }
}

/// One-shot box: agree on a key and encrypt.
///
/// # Errors
///
/// Propagates [`SharedKey::precompute`] and [`SharedKey::encrypt`] errors.
pub fn seal(
    secret: &SecretKey,
    public: &PublicKey,
    nonce: &Nonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    SharedKey::precompute(secret, public)?.encrypt(nonce, plaintext)
}

/// One-shot open: agree on a key and decrypt.
///
/// # Errors
///
/// Propagates [`SharedKey::precompute`] and [`SharedKey::decrypt`] errors.
pub fn open(
    secret: &SecretKey,
    public: &PublicKey,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    SharedKey::precompute(secret, public)?.decrypt(nonce, ciphertext)
}
