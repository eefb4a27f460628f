//! Onion wire formats.
//!
//! Requests travel client -> hop 0 -> hop 1 -> hop 2 -> destination:
//!
//! ```text
//! OnionRequest0  [0x80][nonce][eph pk][box(next addr, layer)]
//! OnionRequest1  [0x81][nonce][eph pk][box(next addr, layer)][return1]
//! OnionRequest2  [0x82][nonce][eph pk][box(dest addr, payload)][return2]
//! to destination payload || return3
//! ```
//!
//! Each hop seals the address it heard from plus the return blob it
//! received into a new return blob with a key only it knows. Responses walk
//! the blobs back:
//!
//! ```text
//! OnionResponse3 [0x8c][return3][payload]   destination -> hop 2
//! OnionResponse2 [0x8d][return2][payload]   hop 2 -> hop 1
//! OnionResponse1 [0x8e][return1][payload]   hop 1 -> hop 0
//! payload                                   hop 0 -> client
//! ```

use crate::dht::key_cache::SharedKeyCache;
use crate::dht::node::PackedNode;
use crate::dht::packet::MAX_SENT_NODES;
use std::net::SocketAddr;
use wisp_crypto::{
    KeyPair, MAC_SIZE, NONCE_SIZE, Nonce, PUBLIC_KEY_SIZE, PublicKey, SecretKey, SharedKey,
};
use wisp_transport::wire::PADDED_ADDR_SIZE;
use wisp_transport::{MAX_UDP_PACKET_SIZE, PacketError, PacketKind, PacketReader, PacketWriter};

use super::OnionError;

/// Bytes one request layer adds: nonce, ephemeral key, MAC
pub const LAYER_OVERHEAD: usize = NONCE_SIZE + PUBLIC_KEY_SIZE + MAC_SIZE;

/// Return blob sealed by hop 0
pub const RETURN_1_SIZE: usize = NONCE_SIZE + PADDED_ADDR_SIZE + MAC_SIZE;
/// Return blob sealed by hop 1
pub const RETURN_2_SIZE: usize = NONCE_SIZE + PADDED_ADDR_SIZE + RETURN_1_SIZE + MAC_SIZE;
/// Return blob sealed by hop 2
pub const RETURN_3_SIZE: usize = NONCE_SIZE + PADDED_ADDR_SIZE + RETURN_2_SIZE + MAC_SIZE;

/// Number of hops in a path
pub const PATH_HOPS: usize = 3;

/// Largest payload a client may push through a path
pub const MAX_ONION_PAYLOAD: usize =
    MAX_UDP_PACKET_SIZE - 1 - PATH_HOPS * (LAYER_OVERHEAD + PADDED_ADDR_SIZE) - RETURN_3_SIZE;

/// Size of the return blob a packet at `hop` carries on the way in
#[must_use]
pub const fn return_size(hop: u8) -> usize {
    match hop {
        0 => 0,
        1 => RETURN_1_SIZE,
        2 => RETURN_2_SIZE,
        _ => RETURN_3_SIZE,
    }
}

/// Request kind received by `hop`
#[must_use]
pub fn request_kind(hop: u8) -> Option<PacketKind> {
    match hop {
        0 => Some(PacketKind::OnionRequest0),
        1 => Some(PacketKind::OnionRequest1),
        2 => Some(PacketKind::OnionRequest2),
        _ => None,
    }
}

/// Response kind received by `hop` (hop 2 hears from the destination)
#[must_use]
pub fn response_kind(hop: u8) -> Option<PacketKind> {
    match hop {
        2 => Some(PacketKind::OnionResponse3),
        1 => Some(PacketKind::OnionResponse2),
        0 => Some(PacketKind::OnionResponse1),
        _ => None,
    }
}

/// Seal one request layer for a hop: `[nonce][eph pk][box(next, inner)]`
///
/// # Errors
///
/// Fails only if encryption fails.
pub fn seal_layer(
    ephemeral: &PublicKey,
    shared: &SharedKey,
    next: &SocketAddr,
    inner: &[u8],
) -> Result<Vec<u8>, OnionError> {
    let mut plain = PacketWriter::new();
    plain.put_addr_padded(next).put_bytes(inner);
    let nonce = Nonce::random();
    let sealed = shared.encrypt(&nonce, &plain.finish())?;

    let mut out = PacketWriter::new();
    out.put_nonce(&nonce).put_key(ephemeral).put_bytes(&sealed);
    Ok(out.finish())
}

/// One layer of an onion request, peeled.
///
/// `hop` counts from 0 (the hop the client talks to); `next` is where the
/// `remaining` bytes go. At hop 2 `remaining` is the final payload, at
/// earlier hops it is the next still-encrypted layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionEnvelope {
    /// Hop that peeled this layer
    pub hop: u8,
    /// Next address
    pub next: SocketAddr,
    /// Bytes left after this layer
    pub remaining: Vec<u8>,
}

impl OnionEnvelope {
    /// Decrypt one layer with the hop's long-term secret.
    ///
    /// # Errors
    ///
    /// Returns an error for short layers and layers not addressed to
    /// `secret`.
    pub fn peel(
        hop: u8,
        layer: &[u8],
        secret: &SecretKey,
        keys: &mut SharedKeyCache,
    ) -> Result<Self, OnionError> {
        let mut reader = PacketReader::new(layer);
        let nonce = reader.nonce()?;
        let ephemeral = reader.key()?;
        let ciphertext = reader.rest();
        if ciphertext.len() < MAC_SIZE + PADDED_ADDR_SIZE {
            return Err(PacketError::Truncated {
                needed: MAC_SIZE + PADDED_ADDR_SIZE,
                available: ciphertext.len(),
            }
            .into());
        }
        let shared = keys.get(secret, &ephemeral)?;
        let plain = shared.decrypt(&nonce, ciphertext)?;

        let mut inner = PacketReader::new(&plain);
        let next = inner.addr_padded()?;
        let remaining = inner.rest().to_vec();
        Ok(Self {
            hop,
            next,
            remaining,
        })
    }
}

/// Seal `(from, previous)` into a return blob
///
/// # Errors
///
/// Fails only if encryption fails.
pub fn seal_return(key: &SharedKey, from: &SocketAddr, previous: &[u8]) -> Result<Vec<u8>, OnionError> {
    let mut plain = PacketWriter::new();
    plain.put_addr_padded(from).put_bytes(previous);
    let nonce = Nonce::random();
    let sealed = key.encrypt(&nonce, &plain.finish())?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a return blob into `(address, previous blob)`
///
/// # Errors
///
/// Fails for blobs sealed under another key.
pub fn open_return(key: &SharedKey, blob: &[u8]) -> Result<(SocketAddr, Vec<u8>), OnionError> {
    let mut reader = PacketReader::new(blob);
    let nonce = reader.nonce()?;
    let plain = key.decrypt(&nonce, reader.rest())?;
    let mut inner = PacketReader::new(&plain);
    let addr = inner.addr_padded()?;
    Ok((addr, inner.rest().to_vec()))
}

/// Announce or search request addressed to an announce node.
///
/// Wire form before hop 2 appends `return3`:
/// `[0x83][nonce][sender pk][box(ping id 32, search key 32, data pk 32, sendback u64)]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    /// Ping id from the previous response, zero on first contact
    pub ping_id: [u8; 32],
    /// Key being searched for; equal to the sender key when announcing
    pub search_key: PublicKey,
    /// Key others should encrypt onion data to; zero when only searching
    pub data_key: PublicKey,
    /// Opaque value echoed in the response
    pub sendback: u64,
}

/// Plaintext size of an announce request box
const ANNOUNCE_REQUEST_PLAIN: usize = 32 + PUBLIC_KEY_SIZE * 2 + 8;

/// Full announce request size including the return blob
pub const ANNOUNCE_REQUEST_SIZE: usize =
    1 + NONCE_SIZE + PUBLIC_KEY_SIZE + ANNOUNCE_REQUEST_PLAIN + MAC_SIZE + RETURN_3_SIZE;

impl AnnounceRequest {
    /// Seal for `server` under `sender`'s key
    ///
    /// # Errors
    ///
    /// Fails for low-order server keys.
    pub fn seal(&self, sender: &KeyPair, server: &PublicKey) -> Result<Vec<u8>, OnionError> {
        let shared = SharedKey::precompute(sender.secret(), server)?;
        let mut plain = PacketWriter::new();
        plain
            .put_bytes(&self.ping_id)
            .put_key(&self.search_key)
            .put_key(&self.data_key)
            .put_u64(self.sendback);
        let nonce = Nonce::random();
        let sealed = shared.encrypt(&nonce, &plain.finish())?;

        let mut out = PacketWriter::with_kind(PacketKind::AnnounceRequest);
        out.put_nonce(&nonce).put_key(&sender.public()).put_bytes(&sealed);
        Ok(out.finish())
    }

    /// Open a request (return blob already split off); returns the sender
    /// key alongside the request.
    ///
    /// # Errors
    ///
    /// Fails for malformed or undecryptable requests.
    pub fn open(
        packet: &[u8],
        secret: &SecretKey,
        keys: &mut SharedKeyCache,
    ) -> Result<(PublicKey, Self), OnionError> {
        let mut reader = PacketReader::expect_kind(packet, PacketKind::AnnounceRequest)?;
        let nonce = reader.nonce()?;
        let sender = reader.key()?;
        let shared = keys.get(secret, &sender)?;
        let plain = shared.decrypt(&nonce, reader.rest())?;

        let mut inner = PacketReader::new(&plain);
        let request = Self {
            ping_id: inner.array()?,
            search_key: inner.key()?,
            data_key: inner.key()?,
            sendback: inner.u64()?,
        };
        inner.finish()?;
        Ok((sender, request))
    }
}

/// Announce response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnounceStatus {
    /// Not announced here, or the ping id was stale; carries a fresh ping id
    NotFound = 0,
    /// The searched key is announced here; carries its data key
    Found = 1,
    /// Announcement stored; carries a fresh ping id
    Announced = 2,
}

impl TryFrom<u8> for AnnounceStatus {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NotFound),
            1 => Ok(Self::Found),
            2 => Ok(Self::Announced),
            _ => Err(PacketError::InvalidField("announce status")),
        }
    }
}

/// Announce response:
/// `[0x84][sendback u64][nonce][box(status u8, ping id or data key 32, count u8, nodes)]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Echoed request value
    pub sendback: u64,
    /// Outcome
    pub status: AnnounceStatus,
    /// Fresh ping id, or the found data key for [`AnnounceStatus::Found`]
    pub token: [u8; 32],
    /// Announce nodes closer to the searched key
    pub nodes: Vec<PackedNode>,
}

impl AnnounceResponse {
    /// Seal for `requester`
    ///
    /// # Errors
    ///
    /// Fails for low-order requester keys.
    pub fn seal(
        &self,
        secret: &SecretKey,
        requester: &PublicKey,
        keys: &mut SharedKeyCache,
    ) -> Result<Vec<u8>, OnionError> {
        let shared = keys.get(secret, requester)?;
        let nodes = &self.nodes[..self.nodes.len().min(MAX_SENT_NODES)];
        let mut plain = PacketWriter::new();
        plain
            .put_u8(self.status as u8)
            .put_bytes(&self.token)
            .put_u8(nodes.len() as u8);
        for node in nodes {
            node.write(&mut plain);
        }
        let nonce = Nonce::random();
        let sealed = shared.encrypt(&nonce, &plain.finish())?;

        let mut out = PacketWriter::with_kind(PacketKind::AnnounceResponse);
        out.put_u64(self.sendback).put_nonce(&nonce).put_bytes(&sealed);
        Ok(out.finish())
    }

    /// Read the sendback value without decrypting
    ///
    /// # Errors
    ///
    /// Fails for short packets or the wrong kind.
    pub fn peek_sendback(packet: &[u8]) -> Result<u64, OnionError> {
        let mut reader = PacketReader::expect_kind(packet, PacketKind::AnnounceResponse)?;
        Ok(reader.u64()?)
    }

    /// Open a response from `server` with the key the request used
    ///
    /// # Errors
    ///
    /// Fails for malformed or undecryptable responses.
    pub fn open(packet: &[u8], secret: &SecretKey, server: &PublicKey) -> Result<Self, OnionError> {
        let mut reader = PacketReader::expect_kind(packet, PacketKind::AnnounceResponse)?;
        let sendback = reader.u64()?;
        let nonce = reader.nonce()?;
        let shared = SharedKey::precompute(secret, server)?;
        let plain = shared.decrypt(&nonce, reader.rest())?;

        let mut inner = PacketReader::new(&plain);
        let status = AnnounceStatus::try_from(inner.u8()?)?;
        let token = inner.array()?;
        let count = inner.u8()? as usize;
        if count > MAX_SENT_NODES {
            return Err(PacketError::InvalidField("node count").into());
        }
        let nodes = (0..count)
            .map(|_| PackedNode::read(&mut inner))
            .collect::<Result<Vec<_>, _>>()?;
        inner.finish()?;
        Ok(Self {
            sendback,
            status,
            token,
            nodes,
        })
    }
}

/// Onion data addressed to an announced key.
///
/// Request: `[0x85][dest pk][nonce][eph pk][box_eph(sender pk, box_real(payload))]`,
/// forwarded to the announcer as `[0x86][nonce][eph pk][box_eph(...)]`.
/// The outer box is to the destination's data key; the inner box is between
/// the two long-term keys and authenticates the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionData {
    /// Long-term key of the sender
    pub sender: PublicKey,
    /// Application payload
    pub payload: Vec<u8>,
}

impl OnionData {
    /// Build a data request for `dest` (long-term key) whose announced data
    /// key is `dest_data_key`
    ///
    /// # Errors
    ///
    /// Fails for low-order keys.
    pub fn seal_request(
        sender: &KeyPair,
        dest: &PublicKey,
        dest_data_key: &PublicKey,
        payload: &[u8],
    ) -> Result<Vec<u8>, OnionError> {
        let nonce = Nonce::random();
        let real = SharedKey::precompute(sender.secret(), dest)?;
        let inner = real.encrypt(&nonce, payload)?;

        let mut plain = PacketWriter::new();
        plain.put_key(&sender.public()).put_bytes(&inner);

        let ephemeral = KeyPair::generate();
        let outer = SharedKey::precompute(ephemeral.secret(), dest_data_key)?;
        let sealed = outer.encrypt(&nonce, &plain.finish())?;

        let mut out = PacketWriter::with_kind(PacketKind::OnionDataRequest);
        out.put_key(dest)
            .put_nonce(&nonce)
            .put_key(&ephemeral.public())
            .put_bytes(&sealed);
        Ok(out.finish())
    }

    /// Split a data request (return blob removed) into its destination and
    /// the forwarded `0x86` packet
    ///
    /// # Errors
    ///
    /// Fails for short packets or the wrong kind.
    pub fn forward(request: &[u8]) -> Result<(PublicKey, Vec<u8>), OnionError> {
        let mut reader = PacketReader::expect_kind(request, PacketKind::OnionDataRequest)?;
        let dest = reader.key()?;
        let body = reader.rest();
        if body.len() < NONCE_SIZE + PUBLIC_KEY_SIZE + MAC_SIZE {
            return Err(PacketError::Truncated {
                needed: NONCE_SIZE + PUBLIC_KEY_SIZE + MAC_SIZE,
                available: body.len(),
            }
            .into());
        }
        let mut out = PacketWriter::with_kind(PacketKind::OnionDataResponse);
        out.put_bytes(body);
        Ok((dest, out.finish()))
    }

    /// Open a forwarded `0x86` packet with our data and long-term secrets
    ///
    /// # Errors
    ///
    /// Fails for malformed packets or either box failing to open.
    pub fn open_response(
        packet: &[u8],
        data_secret: &SecretKey,
        real_secret: &SecretKey,
    ) -> Result<Self, OnionError> {
        let mut reader = PacketReader::expect_kind(packet, PacketKind::OnionDataResponse)?;
        let nonce = reader.nonce()?;
        let ephemeral = reader.key()?;
        let outer = SharedKey::precompute(data_secret, &ephemeral)?;
        let plain = outer.decrypt(&nonce, reader.rest())?;

        let mut inner = PacketReader::new(&plain);
        let sender = inner.key()?;
        let real = SharedKey::precompute(real_secret, &sender)?;
        let payload = real.decrypt(&nonce, inner.rest())?;
        Ok(Self { sender, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_sizes() {
        assert_eq!(RETURN_1_SIZE, 59);
        assert_eq!(RETURN_2_SIZE, 118);
        assert_eq!(RETURN_3_SIZE, 177);
    }

    #[test]
    fn test_return_blob_chain() {
        let k0 = SharedKey::generate();
        let k1 = SharedKey::generate();
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "[2001:db8::1]:2000".parse().unwrap();

        let r1 = seal_return(&k0, &a, &[]).unwrap();
        assert_eq!(r1.len(), RETURN_1_SIZE);
        let r2 = seal_return(&k1, &b, &r1).unwrap();
        assert_eq!(r2.len(), RETURN_2_SIZE);

        let (addr, prev) = open_return(&k1, &r2).unwrap();
        assert_eq!(addr, b);
        assert_eq!(prev, r1);
        assert!(open_return(&k0, &r2).is_err());
    }

    #[test]
    fn test_layer_peel() {
        let hop = KeyPair::generate();
        let eph = KeyPair::generate();
        let shared = SharedKey::precompute(eph.secret(), &hop.public()).unwrap();
        let next: SocketAddr = "192.0.2.7:33445".parse().unwrap();
        let layer = seal_layer(&eph.public(), &shared, &next, b"inner").unwrap();

        let mut keys = SharedKeyCache::new(4);
        let env = OnionEnvelope::peel(1, &layer, hop.secret(), &mut keys).unwrap();
        assert_eq!(env.hop, 1);
        assert_eq!(env.next, next);
        assert_eq!(env.remaining, b"inner");

        let other = KeyPair::generate();
        assert!(OnionEnvelope::peel(1, &layer, other.secret(), &mut keys).is_err());
    }

    #[test]
    fn test_announce_request_open() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let request = AnnounceRequest {
            ping_id: [7; 32],
            search_key: client.public(),
            data_key: KeyPair::generate().public(),
            sendback: 99,
        };
        let packet = request.seal(&client, &server.public()).unwrap();
        assert_eq!(packet.len() + RETURN_3_SIZE, ANNOUNCE_REQUEST_SIZE);

        let mut keys = SharedKeyCache::new(4);
        let (sender, opened) = AnnounceRequest::open(&packet, server.secret(), &mut keys).unwrap();
        assert_eq!(sender, client.public());
        assert_eq!(opened, request);
    }

    #[test]
    fn test_announce_response_rejects_too_many_nodes() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let node = PackedNode::new(KeyPair::generate().public(), "10.1.1.1:1".parse().unwrap());
        let response = AnnounceResponse {
            sendback: 5,
            status: AnnounceStatus::NotFound,
            token: [1; 32],
            nodes: vec![node; 6],
        };
        let mut keys = SharedKeyCache::new(4);
        let packet = response
            .seal(server.secret(), &client.public(), &mut keys)
            .unwrap();
        assert_eq!(AnnounceResponse::peek_sendback(&packet).unwrap(), 5);
        let opened = AnnounceResponse::open(&packet, client.secret(), &server.public()).unwrap();
        // capped on the way out
        assert_eq!(opened.nodes.len(), MAX_SENT_NODES);
    }

    #[test]
    fn test_onion_data_forward_and_open() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let bob_data = KeyPair::generate();

        let request =
            OnionData::seal_request(&alice, &bob.public(), &bob_data.public(), b"hi bob").unwrap();
        let (dest, forwarded) = OnionData::forward(&request).unwrap();
        assert_eq!(dest, bob.public());

        let data = OnionData::open_response(&forwarded, bob_data.secret(), bob.secret()).unwrap();
        assert_eq!(data.sender, alice.public());
        assert_eq!(data.payload, b"hi bob");

        let mallory = KeyPair::generate();
        assert!(OnionData::open_response(&forwarded, mallory.secret(), bob.secret()).is_err());
    }
}
