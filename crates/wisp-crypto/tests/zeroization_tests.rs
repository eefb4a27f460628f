//! Zeroization validation tests
//!
//! Verifies that symmetric key material can be wiped and that secrets never
//! leak through `Debug` output.

use wisp_crypto::{KeyPair, Nonce, SharedKey};
use zeroize::Zeroize;

fn is_zeroed(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[test]
fn test_shared_key_zeroize_clears_bytes() {
    let mut key = SharedKey::from_bytes([42u8; 32]);
    assert!(!is_zeroed(key.as_bytes()));

    key.zeroize();
    assert!(is_zeroed(key.as_bytes()));
}

#[test]
fn test_precomputed_key_zeroize() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let mut key = SharedKey::precompute(alice.secret(), &bob.public()).unwrap();

    // Usable before wiping
    let nonce = Nonce::random();
    let ct = key.encrypt(&nonce, b"data").unwrap();
    assert_eq!(key.decrypt(&nonce, &ct).unwrap(), b"data");

    key.zeroize();
    assert!(is_zeroed(key.as_bytes()));
    assert!(key.decrypt(&nonce, &ct).is_err());
}

#[test]
fn test_debug_output_redacted() {
    let pair = KeyPair::generate();
    let key = SharedKey::generate();

    let pair_debug = format!("{pair:?}");
    let key_debug = format!("{key:?}");

    assert!(pair_debug.contains("REDACTED"));
    assert!(key_debug.contains("REDACTED"));
    assert!(!key_debug.contains(&hex::encode(key.as_bytes())));
}
