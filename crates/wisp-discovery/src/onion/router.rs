//! Hop role: peel requests, wrap return paths, walk responses back.
//!
//! Every DHT node acts as an onion hop for others. A hop keeps no per-path
//! state; everything it needs to route a response is inside the return blob,
//! sealed with a symmetric key that rotates. Blobs sealed under the previous
//! key still open, so a rotation never breaks a response already in flight.

use super::packet::{OnionEnvelope, open_return, request_kind, response_kind, return_size, seal_return};
use super::packet::LAYER_OVERHEAD;
use super::{OnionConfig, OnionError};
use crate::dht::key_cache::SharedKeyCache;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{KeyPair, SharedKey};
use wisp_transport::wire::PADDED_ADDR_SIZE;
use wisp_transport::{MAX_UDP_PACKET_SIZE, PacketError, PacketKind, Transmit};

/// Router counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Request layers peeled and forwarded
    pub requests_forwarded: u64,
    /// Responses walked back one hop
    pub responses_forwarded: u64,
    /// Packets rejected
    pub dropped: u64,
}

struct ReturnSecrets {
    current: SharedKey,
    previous: SharedKey,
    rotated: Instant,
    period: Duration,
}

impl ReturnSecrets {
    fn open(&self, blob: &[u8]) -> Result<(SocketAddr, Vec<u8>), OnionError> {
        open_return(&self.current, blob).or_else(|_| open_return(&self.previous, blob))
    }

    fn rotate_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.rotated) >= self.period {
            self.previous = std::mem::replace(&mut self.current, SharedKey::generate());
            self.rotated = now;
            tracing::debug!("rotated onion return key");
        }
    }
}

/// Onion hop
pub struct OnionRouter {
    keypair: KeyPair,
    keys: SharedKeyCache,
    secrets: ReturnSecrets,
    outbox: VecDeque<Transmit>,
    stats: RouterStats,
}

impl OnionRouter {
    /// Hop using the node's DHT keypair
    #[must_use]
    pub fn new(keypair: KeyPair, config: &OnionConfig, now: Instant) -> Self {
        Self {
            keypair,
            keys: SharedKeyCache::new(config.key_cache_size),
            secrets: ReturnSecrets {
                current: SharedKey::generate(),
                previous: SharedKey::generate(),
                rotated: now,
                period: config.return_key_rotation,
            },
            outbox: VecDeque::new(),
            stats: RouterStats::default(),
        }
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Handle an onion request or response addressed to this hop.
    ///
    /// # Errors
    ///
    /// Malformed packets and layers this hop cannot open are rejected.
    pub fn handle_packet(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Result<(), OnionError> {
        self.secrets.rotate_if_due(now);
        let result = self.route(from, data);
        if result.is_err() {
            self.stats.dropped += 1;
        }
        result
    }

    fn route(&mut self, from: SocketAddr, data: &[u8]) -> Result<(), OnionError> {
        if data.len() > MAX_UDP_PACKET_SIZE {
            return Err(PacketError::TooLarge {
                size: data.len(),
                max: MAX_UDP_PACKET_SIZE,
            }
            .into());
        }
        match PacketKind::of(data)? {
            PacketKind::OnionRequest0 => self.forward_request(0, from, data),
            PacketKind::OnionRequest1 => self.forward_request(1, from, data),
            PacketKind::OnionRequest2 => self.forward_request(2, from, data),
            PacketKind::OnionResponse3 => self.forward_response(2, data),
            PacketKind::OnionResponse2 => self.forward_response(1, data),
            PacketKind::OnionResponse1 => self.forward_response(0, data),
            other => Err(PacketError::UnexpectedKind(other).into()),
        }
    }

    /// Rotate the return key when due
    pub fn iterate(&mut self, now: Instant) {
        self.secrets.rotate_if_due(now);
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    fn forward_request(&mut self, hop: u8, from: SocketAddr, data: &[u8]) -> Result<(), OnionError> {
        let body = &data[1..];
        let previous_len = return_size(hop);
        let needed = previous_len + LAYER_OVERHEAD + PADDED_ADDR_SIZE;
        if body.len() < needed {
            return Err(PacketError::Truncated {
                needed,
                available: body.len(),
            }
            .into());
        }
        let (layer, previous) = body.split_at(body.len() - previous_len);
        let envelope = OnionEnvelope::peel(hop, layer, self.keypair.secret(), &mut self.keys)?;
        let blob = seal_return(&self.secrets.current, &from, previous)?;

        let mut out = Vec::with_capacity(1 + envelope.remaining.len() + blob.len());
        match request_kind(hop + 1) {
            Some(kind) => {
                out.push(kind.into());
                out.extend_from_slice(&envelope.remaining);
            }
            None => {
                let kind = PacketKind::of(&envelope.remaining)?;
                if !matches!(kind, PacketKind::AnnounceRequest | PacketKind::OnionDataRequest) {
                    return Err(PacketError::UnexpectedKind(kind).into());
                }
                out.extend_from_slice(&envelope.remaining);
            }
        }
        out.extend_from_slice(&blob);

        tracing::trace!("onion hop {} forwarding {} bytes to {}", hop, out.len(), envelope.next);
        self.outbox.push_back(Transmit::new(envelope.next, out));
        self.stats.requests_forwarded += 1;
        Ok(())
    }

    fn forward_response(&mut self, hop: u8, data: &[u8]) -> Result<(), OnionError> {
        let body = &data[1..];
        let blob_len = return_size(hop + 1);
        if body.len() <= blob_len {
            return Err(PacketError::Truncated {
                needed: blob_len + 1,
                available: body.len(),
            }
            .into());
        }
        let (blob, payload) = body.split_at(blob_len);
        let (addr, previous) = self.secrets.open(blob)?;
        if previous.len() != return_size(hop) {
            return Err(PacketError::InvalidField("return blob").into());
        }

        let out = match hop.checked_sub(1).and_then(response_kind) {
            Some(kind) => {
                let mut out = Vec::with_capacity(1 + previous.len() + payload.len());
                out.push(kind.into());
                out.extend_from_slice(&previous);
                out.extend_from_slice(payload);
                out
            }
            None => {
                let kind = PacketKind::of(payload)?;
                if !matches!(kind, PacketKind::AnnounceResponse | PacketKind::OnionDataResponse) {
                    return Err(PacketError::UnexpectedKind(kind).into());
                }
                payload.to_vec()
            }
        };
        self.outbox.push_back(Transmit::new(addr, out));
        self.stats.responses_forwarded += 1;
        Ok(())
    }
}

impl std::fmt::Debug for OnionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionRouter")
            .field("public_key", &self.keypair.public())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
