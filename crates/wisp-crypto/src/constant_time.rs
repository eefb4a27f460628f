//! Constant-time comparison.
//!
//! Used wherever a remote party presents a token we issued (ping ids,
//! cookie hashes) so that timing does not leak how many bytes matched.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `false` immediately for slices of different length.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 32-byte array comparison.
#[must_use]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

/// Timing-safe `u64` comparison.
#[must_use]
pub fn verify_u64(a: u64, b: u64) -> bool {
    a.to_le_bytes().ct_eq(&b.to_le_bytes()).into()
}
