//! XOR distance metric.
//!
//! Distances are 256-bit big-endian integers, so the derived byte-wise
//! ordering is the numeric ordering.

use std::cmp::Ordering;
use wisp_crypto::PublicKey;

/// Number of bits in a key
pub const KEY_BITS: usize = 256;

/// XOR distance between two keys
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Distance([u8; 32]);

impl Distance {
    /// Largest possible distance
    pub const MAX: Self = Self([0xff; 32]);

    /// Distance between two keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use wisp_crypto::PublicKey;
    /// use wisp_discovery::dht::Distance;
    ///
    /// let a = PublicKey::from_bytes([1u8; 32]);
    /// let b = PublicKey::from_bytes([2u8; 32]);
    /// assert_eq!(Distance::between(&a, &b).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn between(a: &PublicKey, b: &PublicKey) -> Self {
        let mut out = [0u8; 32];
        for (byte, (x, y)) in out.iter_mut().zip(a.as_bytes().iter().zip(b.as_bytes())) {
            *byte = x ^ y;
        }
        Self(out)
    }

    /// Raw distance bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Leading zero bits (256 for identical keys)
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count
    }

    /// Zero distance (same key)
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Bucket holding `other` in a table owned by `own`.
///
/// Bucket 0 holds the farthest half of the key space. Returns `None` for
/// `own` itself, which never enters a table.
#[must_use]
pub fn bucket_index(own: &PublicKey, other: &PublicKey) -> Option<usize> {
    let zeros = Distance::between(own, other).leading_zeros();
    (zeros < KEY_BITS).then_some(zeros)
}

/// Order `a` and `b` by closeness to `target`.
#[must_use]
pub fn cmp_distance(target: &PublicKey, a: &PublicKey, b: &PublicKey) -> Ordering {
    Distance::between(target, a).cmp(&Distance::between(target, b))
}

/// A key whose distance from `own` falls in bucket `index`.
///
/// Used to refresh a bucket by searching for a random key inside it.
#[must_use]
pub fn random_key_in_bucket(own: &PublicKey, index: usize) -> PublicKey {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let own = own.as_bytes();
    let index = index.min(KEY_BITS - 1);

    // Copy the first `index` bits from own, flip bit `index`, keep the rest random
    for bit in 0..=index {
        let byte = bit / 8;
        let mask = 0x80u8 >> (bit % 8);
        let own_bit = own[byte] & mask;
        let want = if bit == index { own_bit ^ mask } else { own_bit };
        bytes[byte] = (bytes[byte] & !mask) | want;
    }
    PublicKey::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(first: u8) -> PublicKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        PublicKey::from_bytes(bytes)
    }

    #[test]
    fn test_distance_symmetric() {
        let a = PublicKey::from_bytes([0x5a; 32]);
        let b = PublicKey::from_bytes([0xa5; 32]);
        assert_eq!(Distance::between(&a, &b), Distance::between(&b, &a));
        assert!(Distance::between(&a, &a).is_zero());
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(Distance::between(&key(0), &key(0b0000_1000)).leading_zeros(), 4);
        assert_eq!(Distance::between(&key(0), &key(0x80)).leading_zeros(), 0);
        assert_eq!(Distance::between(&key(1), &key(1)).leading_zeros(), 256);
    }

    #[test]
    fn test_bucket_index() {
        let own = key(0);
        assert_eq!(bucket_index(&own, &key(0x80)), Some(0));
        assert_eq!(bucket_index(&own, &key(0x01)), Some(7));
        assert_eq!(bucket_index(&own, &own), None);
    }

    #[test]
    fn test_cmp_distance() {
        let target = key(0x10);
        assert_eq!(cmp_distance(&target, &key(0x11), &key(0x30)), Ordering::Less);
        assert_eq!(cmp_distance(&target, &key(0x30), &key(0x11)), Ordering::Greater);
        assert_eq!(cmp_distance(&target, &key(0x11), &key(0x11)), Ordering::Equal);
    }

    #[test]
    fn test_random_key_in_bucket() {
        let own = PublicKey::from_bytes([0x3c; 32]);
        for index in [0, 1, 7, 8, 100, 255] {
            let k = random_key_in_bucket(&own, index);
            assert_eq!(bucket_index(&own, &k), Some(index));
        }
    }
}
