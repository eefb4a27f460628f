//! Bounded cache of precomputed box keys.

use std::collections::HashMap;
use wisp_crypto::{CryptoError, PublicKey, SecretKey, SharedKey};

/// Precomputed-key cache with least-recently-used eviction
#[derive(Debug)]
pub struct SharedKeyCache {
    entries: HashMap<PublicKey, (SharedKey, u64)>,
    capacity: usize,
    clock: u64,
}

impl SharedKeyCache {
    /// Create a cache holding at most `capacity` keys
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Shared key between `secret` and `public`, computing it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for low-order keys.
    pub fn get(&mut self, secret: &SecretKey, public: &PublicKey) -> Result<SharedKey, CryptoError> {
        self.clock += 1;
        if let Some((key, used)) = self.entries.get_mut(public) {
            *used = self.clock;
            return Ok(key.clone());
        }

        let key = SharedKey::precompute(secret, public)?;
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(*public, (key.clone(), self.clock));
        Ok(key)
    }

    /// Cached keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
