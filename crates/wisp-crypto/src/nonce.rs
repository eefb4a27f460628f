//! Nonce utilities.
//!
//! Nonces are 24 bytes, treated as a big-endian integer when incremented.
//! Counter nonces are produced from a random base with [`Nonce::add`] so
//! both directions of a connection never share a nonce under one key.

use crate::{CryptoError, NONCE_SIZE};
use rand_core::{OsRng, RngCore};

/// 24-byte nonce for `XChaCha20-Poly1305`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// All-zero nonce
    pub const ZERO: Self = Self([0u8; NONCE_SIZE]);

    /// Generate a random nonce
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] if the slice is not 24 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; NONCE_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidNonceLength {
                    expected: NONCE_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Raw nonce bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Increment in place (big-endian, wrapping at 2^192)
    pub fn increment(&mut self) {
        *self = self.add(1);
    }

    /// Return `self + value` as a big-endian integer.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn add(&self, value: u64) -> Self {
        let mut out = self.0;
        let mut carry = u128::from(value);
        for byte in out.iter_mut().rev() {
            if carry == 0 {
                break;
            }
            let sum = u128::from(*byte) + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
        Self(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_carries() {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[NONCE_SIZE - 1] = 0xff;
        let mut nonce = Nonce::from_bytes(bytes);
        nonce.increment();

        let bytes = nonce.as_bytes();
        assert_eq!(bytes[NONCE_SIZE - 1], 0x00);
        assert_eq!(bytes[NONCE_SIZE - 2], 0x01);
    }

    #[test]
    fn test_add_matches_repeated_increment() {
        let base = Nonce::random();
        let mut stepped = base;
        for _ in 0..300 {
            stepped.increment();
        }
        assert_eq!(base.add(300), stepped);
    }

    #[test]
    fn test_add_wraps_full_width() {
        let max = Nonce::from_bytes([0xff; NONCE_SIZE]);
        assert_eq!(max.add(1), Nonce::ZERO);
    }

    #[test]
    fn test_add_large_value() {
        let nonce = Nonce::ZERO.add(u64::MAX);
        let bytes = nonce.as_bytes();
        assert_eq!(&bytes[..16], &[0u8; 16]);
        assert_eq!(&bytes[16..], &[0xff; 8]);

        let next = nonce.add(1);
        assert_eq!(next.as_bytes()[15], 0x01);
        assert_eq!(&next.as_bytes()[16..], &[0u8; 8]);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Nonce::from_slice(&[0u8; 23]).is_err());
        assert!(Nonce::from_slice(&[0u8; 24]).is_ok());
    }
}
