//! BLAKE3 hashing and keyed hashing.

use crate::HASH_SIZE;

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; HASH_SIZE];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Keyed BLAKE3 over several parts, used as a MAC for stateless tokens.
#[must_use]
pub fn keyed_hash(key: &[u8; 32], parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new_keyed(key);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Derive a 32-byte key from `material` under a fixed context string.
#[must_use]
pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"wisp"), hash(b"wisp"));
        assert_ne!(hash(b"wisp"), hash(b"wisq"));
    }

    #[test]
    fn test_keyed_hash_parts_concatenate() {
        let key = [7u8; 32];
        assert_eq!(keyed_hash(&key, &[b"ab", b"cd"]), keyed_hash(&key, &[b"abcd"]));
        assert_ne!(keyed_hash(&key, &[b"abcd"]), keyed_hash(&[8u8; 32], &[b"abcd"]));
    }

    #[test]
    fn test_derive_key_context_separation() {
        assert_ne!(derive_key("a", b"m"), derive_key("b", b"m"));
    }
}
