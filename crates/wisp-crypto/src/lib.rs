//! # wisp Crypto
//!
//! Cryptographic primitives shared by every wisp layer.
//!
//! This crate provides:
//! - X25519 key pairs (a [`PublicKey`] is also a node's identity on the network)
//! - Precomputed "box" keys with `XChaCha20-Poly1305` authenticated encryption
//! - Nonce utilities (random, increment, counter offsets)
//! - A sliding replay window for counter nonces
//! - BLAKE3 hashing helpers and constant-time comparison
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Box | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 | 128-bit collision |
//!
//! Secret material ([`SecretKey`], [`SharedKey`]) is zeroized on drop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod keys;
pub mod nonce;
pub mod random;
pub mod replay;

pub use aead::SharedKey;
pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use nonce::Nonce;
pub use replay::ReplayWindow;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// Precomputed shared key size
pub const SHARED_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const MAC_SIZE: usize = 16;

/// BLAKE3 output size
pub const HASH_SIZE: usize = 32;
