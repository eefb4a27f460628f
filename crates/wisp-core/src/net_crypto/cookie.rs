//! Stateless cookies.
//!
//! A cookie is `nonce || seal(cookie_key, time, real pk, dht pk)` under a
//! key only its maker knows. Handing one out costs the responder no state,
//! and a handshake is only accepted when it carries a fresh cookie we made,
//! which proves the initiator can receive at the address it claims.

use std::time::{Duration, Instant};
use wisp_crypto::{KeyPair, MAC_SIZE, NONCE_SIZE, Nonce, PUBLIC_KEY_SIZE, PublicKey, SharedKey};
use wisp_transport::{PacketError, PacketKind, PacketReader, PacketWriter};

use super::NetCryptoError;

const COOKIE_PLAIN_SIZE: usize = 8 + PUBLIC_KEY_SIZE * 2;

/// Sealed cookie length
pub const COOKIE_SIZE: usize = NONCE_SIZE + COOKIE_PLAIN_SIZE + MAC_SIZE;

/// Cookie request length
pub const COOKIE_REQUEST_SIZE: usize =
    1 + PUBLIC_KEY_SIZE + NONCE_SIZE + PUBLIC_KEY_SIZE * 2 + 8 + MAC_SIZE;

/// Cookie response length
pub const COOKIE_RESPONSE_SIZE: usize = 1 + NONCE_SIZE + COOKIE_SIZE + 8 + MAC_SIZE;

/// Opened cookie contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    /// Seconds since the maker's epoch
    pub time: u64,
    /// Long-term key of the party the cookie was made for
    pub real: PublicKey,
    /// DHT key of that party
    pub dht: PublicKey,
}

/// Makes and checks cookies under a private key
pub struct CookieJar {
    key: SharedKey,
    epoch: Instant,
    timeout: Duration,
}

impl CookieJar {
    /// New jar with a random key; cookies live for `timeout`
    #[must_use]
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            key: SharedKey::generate(),
            epoch: now,
            timeout,
        }
    }

    fn seconds(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    /// Seal a cookie for `real`/`dht`.
    ///
    /// # Errors
    ///
    /// Propagates encryption errors.
    pub fn bake(&self, real: &PublicKey, dht: &PublicKey, now: Instant) -> Result<[u8; COOKIE_SIZE], NetCryptoError> {
        let nonce = Nonce::random();
        let mut plain = PacketWriter::new();
        plain.put_u64(self.seconds(now)).put_key(real).put_key(dht);
        let sealed = self.key.encrypt(&nonce, &plain.finish())?;

        let mut cookie = [0u8; COOKIE_SIZE];
        cookie[..NONCE_SIZE].copy_from_slice(nonce.as_bytes());
        cookie[NONCE_SIZE..].copy_from_slice(&sealed);
        Ok(cookie)
    }

    /// Open a cookie we made and check it has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::InvalidCookie`] for foreign, tampered or
    /// stale cookies.
    pub fn open(&self, cookie: &[u8; COOKIE_SIZE], now: Instant) -> Result<Cookie, NetCryptoError> {
        let mut r = PacketReader::new(cookie);
        let nonce = r.nonce()?;
        let plain = self
            .key
            .decrypt(&nonce, r.rest())
            .map_err(|_| NetCryptoError::InvalidCookie)?;

        let mut r = PacketReader::new(&plain);
        let time = r.u64()?;
        let real = r.key()?;
        let dht = r.key()?;

        let current = self.seconds(now);
        if time > current || current - time > self.timeout.as_secs() {
            return Err(NetCryptoError::InvalidCookie);
        }
        Ok(Cookie { time, real, dht })
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Cookie request, boxed between the two DHT keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRequest {
    /// Requester's DHT key (sent in clear)
    pub sender_dht: PublicKey,
    /// Requester's long-term key
    pub real: PublicKey,
    /// Value echoed in the response
    pub echo: u64,
}

impl CookieRequest {
    /// Seal a request from `dht` to `peer_dht`.
    ///
    /// # Errors
    ///
    /// Propagates key agreement and encryption errors.
    pub fn seal(dht: &KeyPair, peer_dht: &PublicKey, real: &PublicKey, echo: u64) -> Result<Vec<u8>, NetCryptoError> {
        let key = SharedKey::precompute(dht.secret(), peer_dht)?;
        let nonce = Nonce::random();
        let mut plain = PacketWriter::new();
        plain
            .put_key(real)
            .put_bytes(&[0u8; PUBLIC_KEY_SIZE])
            .put_u64(echo);
        let sealed = key.encrypt(&nonce, &plain.finish())?;

        let mut w = PacketWriter::with_kind(PacketKind::CookieRequest);
        w.put_key(&dht.public()).put_nonce(&nonce).put_bytes(&sealed);
        Ok(w.finish())
    }

    /// Open a request addressed to `dht`.
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong size or a box that does not open.
    pub fn open(packet: &[u8], dht: &KeyPair) -> Result<Self, NetCryptoError> {
        if packet.len() != COOKIE_REQUEST_SIZE {
            return Err(PacketError::InvalidField("cookie request length").into());
        }
        let mut r = PacketReader::expect_kind(packet, PacketKind::CookieRequest)?;
        let sender_dht = r.key()?;
        let nonce = r.nonce()?;
        let plain = SharedKey::precompute(dht.secret(), &sender_dht)?.decrypt(&nonce, r.rest())?;

        let mut r = PacketReader::new(&plain);
        let real = r.key()?;
        r.bytes(PUBLIC_KEY_SIZE)?;
        let echo = r.u64()?;
        Ok(Self {
            sender_dht,
            real,
            echo,
        })
    }
}

/// Cookie response, boxed between the two DHT keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieResponse {
    /// Cookie the requester puts in its handshake
    pub cookie: [u8; COOKIE_SIZE],
    /// Echo from the request
    pub echo: u64,
}

impl CookieResponse {
    /// Seal under the precomputed DHT key
    ///
    /// # Errors
    ///
    /// Propagates encryption errors.
    pub fn seal(&self, key: &SharedKey) -> Result<Vec<u8>, NetCryptoError> {
        let nonce = Nonce::random();
        let mut plain = PacketWriter::new();
        plain.put_bytes(&self.cookie).put_u64(self.echo);
        let sealed = key.encrypt(&nonce, &plain.finish())?;

        let mut w = PacketWriter::with_kind(PacketKind::CookieResponse);
        w.put_nonce(&nonce).put_bytes(&sealed);
        Ok(w.finish())
    }

    /// Open with the precomputed DHT key shared with the responder.
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong size or a box that does not open.
    pub fn open(packet: &[u8], key: &SharedKey) -> Result<Self, NetCryptoError> {
        if packet.len() != COOKIE_RESPONSE_SIZE {
            return Err(PacketError::InvalidField("cookie response length").into());
        }
        let mut r = PacketReader::expect_kind(packet, PacketKind::CookieResponse)?;
        let nonce = r.nonce()?;
        let plain = key.decrypt(&nonce, r.rest())?;

        let mut r = PacketReader::new(&plain);
        let cookie = r.array::<COOKIE_SIZE>()?;
        let echo = r.u64()?;
        Ok(Self { cookie, echo })
    }
}
