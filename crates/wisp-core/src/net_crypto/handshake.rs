//! Handshake packets.
//!
//! ```text
//! [0x1a][cookie][nonce][box_real(base nonce, session pk, hash(cookie), cookie for peer)]
//! ```
//!
//! The outer cookie was made by the receiver, which checks it first; the
//! hash inside the box binds it to this handshake. The inner cookie is one
//! the sender made for the receiver, so the receiver can answer with its
//! own handshake without another cookie round trip.

use wisp_crypto::constant_time::verify_32;
use wisp_crypto::hash::hash;
use wisp_crypto::{HASH_SIZE, MAC_SIZE, NONCE_SIZE, Nonce, PUBLIC_KEY_SIZE, PublicKey, SecretKey, SharedKey};
use wisp_transport::{PacketError, PacketKind, PacketReader, PacketWriter};

use super::NetCryptoError;
use super::cookie::COOKIE_SIZE;

const HANDSHAKE_PLAIN_SIZE: usize = NONCE_SIZE + PUBLIC_KEY_SIZE + HASH_SIZE + COOKIE_SIZE;

/// Handshake packet length
pub const HANDSHAKE_PACKET_SIZE: usize = 1 + COOKIE_SIZE + NONCE_SIZE + HANDSHAKE_PLAIN_SIZE + MAC_SIZE;

/// Boxed handshake contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Sender's base nonce for data packets
    pub base_nonce: Nonce,
    /// Sender's session public key
    pub session: PublicKey,
    /// Cookie the sender made for the receiver
    pub cookie_for_peer: [u8; COOKIE_SIZE],
}

impl Handshake {
    /// Seal for `peer_real`, presenting `cookie` (made by the peer).
    ///
    /// # Errors
    ///
    /// Propagates key agreement and encryption errors.
    pub fn seal(
        &self,
        real: &SecretKey,
        peer_real: &PublicKey,
        cookie: &[u8; COOKIE_SIZE],
    ) -> Result<Vec<u8>, NetCryptoError> {
        let nonce = Nonce::random();
        let mut plain = PacketWriter::new();
        plain
            .put_nonce(&self.base_nonce)
            .put_key(&self.session)
            .put_bytes(&hash(cookie))
            .put_bytes(&self.cookie_for_peer);
        let sealed = SharedKey::precompute(real, peer_real)?.encrypt(&nonce, &plain.finish())?;

        let mut w = PacketWriter::with_kind(PacketKind::CryptoHandshake);
        w.put_bytes(cookie).put_nonce(&nonce).put_bytes(&sealed);
        Ok(w.finish())
    }

    /// Outer cookie, to be checked before anything is decrypted
    ///
    /// # Errors
    ///
    /// Returns an error for a packet of the wrong kind or size.
    pub fn peek_cookie(packet: &[u8]) -> Result<[u8; COOKIE_SIZE], PacketError> {
        if packet.len() != HANDSHAKE_PACKET_SIZE {
            return Err(PacketError::InvalidField("handshake length"));
        }
        PacketReader::expect_kind(packet, PacketKind::CryptoHandshake)?.array::<COOKIE_SIZE>()
    }

    /// Open a handshake from `peer_real`.
    ///
    /// # Errors
    ///
    /// Returns an error when the box does not open or the cookie hash does
    /// not match the outer cookie.
    pub fn open(packet: &[u8], real: &SecretKey, peer_real: &PublicKey) -> Result<Self, NetCryptoError> {
        let cookie = Self::peek_cookie(packet)?;
        let mut r = PacketReader::new(&packet[1 + COOKIE_SIZE..]);
        let nonce = r.nonce()?;
        let plain = SharedKey::precompute(real, peer_real)?.decrypt(&nonce, r.rest())?;

        let mut r = PacketReader::new(&plain);
        let base_nonce = r.nonce()?;
        let session = r.key()?;
        let cookie_hash = r.array::<HASH_SIZE>()?;
        let cookie_for_peer = r.array::<COOKIE_SIZE>()?;
        r.finish()?;

        if !verify_32(&cookie_hash, &hash(&cookie)) {
            return Err(NetCryptoError::HandshakeMismatch);
        }
        Ok(Self {
            base_nonce,
            session,
            cookie_for_peer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_crypto::KeyPair;

    fn handshake() -> Handshake {
        Handshake {
            base_nonce: Nonce::random(),
            session: KeyPair::generate().public(),
            cookie_for_peer: [3u8; COOKIE_SIZE],
        }
    }

    #[test]
    fn test_seal_open() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let cookie = [9u8; COOKIE_SIZE];
        let hs = handshake();
        let packet = hs.seal(a.secret(), &b.public(), &cookie).unwrap();
        assert_eq!(packet.len(), HANDSHAKE_PACKET_SIZE);
        assert_eq!(Handshake::peek_cookie(&packet).unwrap(), cookie);
        assert_eq!(Handshake::open(&packet, b.secret(), &a.public()).unwrap(), hs);
    }

    #[test]
    fn test_swapped_cookie_rejected() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let mut packet = handshake().seal(a.secret(), &b.public(), &[9u8; COOKIE_SIZE]).unwrap();
        packet[1] ^= 0xff;
        assert!(matches!(
            Handshake::open(&packet, b.secret(), &a.public()),
            Err(NetCryptoError::HandshakeMismatch)
        ));
    }

    #[test]
    fn test_wrong_sender_rejected() {
        let (a, b) = (KeyPair::generate(), KeyPair::generate());
        let packet = handshake().seal(a.secret(), &b.public(), &[9u8; COOKIE_SIZE]).unwrap();
        let mallory = KeyPair::generate().public();
        assert!(matches!(
            Handshake::open(&packet, b.secret(), &mallory),
            Err(NetCryptoError::Crypto(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(Handshake::peek_cookie(&[0x1a; 100]).is_err());
    }
}
