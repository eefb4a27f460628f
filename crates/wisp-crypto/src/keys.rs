//! X25519 key pairs.
//!
//! A [`PublicKey`] is the 32-byte identifier of a peer. Keys compare
//! bytewise, hash, and serialize, so they can be used directly as map keys
//! and as the XOR-distance metric space of the DHT.

use crate::{CryptoError, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::StaticSecret;

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Copy out the raw key bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// Full lowercase hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_SIZE,
            actual: s.len() / 2,
        })?;
        Self::from_slice(&bytes)
    }
}

/// X25519 secret key (zeroized on drop).
#[derive(Clone)]
pub struct SecretKey(pub(crate) StaticSecret);

impl SecretKey {
    /// Generate a fresh secret from the OS CSPRNG
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Export raw bytes. Callers own zeroizing the copy.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Derive the matching public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// A secret key with its public half.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a new random key pair
    #[must_use]
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    /// Build a key pair around an existing secret
    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    /// Restore a key pair from raw secret bytes
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_secret(SecretKey::from_bytes(bytes))
    }

    /// Public half
    #[must_use]
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Secret half
    #[must_use]
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn test_public_from_secret_roundtrip() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(pair.secret().to_bytes());
        assert_eq!(pair.public(), restored.public());
    }

    #[test]
    fn test_rfc7748_public_key() {
        // RFC 7748 section 6.1, Alice
        let secret: [u8; 32] =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap()
                .try_into()
                .unwrap();
        let pair = KeyPair::from_secret_bytes(secret);
        assert_eq!(
            pair.public().to_hex(),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
    }

    #[test]
    fn test_public_key_from_slice_length() {
        assert!(PublicKey::from_slice(&[0u8; 31]).is_err());
        assert!(PublicKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_public_key_hex_parse() {
        let pair = KeyPair::generate();
        let parsed: PublicKey = pair.public().to_hex().parse().unwrap();
        assert_eq!(parsed, pair.public());
        assert!("zz".parse::<PublicKey>().is_err());
    }

    #[test]
    fn test_secret_debug_redacted() {
        let pair = KeyPair::generate();
        let debug = format!("{:?}", pair.secret());
        assert!(debug.contains("REDACTED"));
    }
}
