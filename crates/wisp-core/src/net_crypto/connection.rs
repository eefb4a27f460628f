//! One crypto connection: session keys, nonce counters, buffers and
//! congestion state for a single peer.
//!
//! A connection never sends anything itself. The controller asks it to
//! seal packets and decides which route they take.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{CryptoError, KeyPair, Nonce, PublicKey, ReplayWindow, SharedKey};
use wisp_transport::timer::is_timeout;

use super::buffer::{Inserted, RecvBuffer, SendBuffer};
use super::congestion::Congestion;
use super::cookie::COOKIE_SIZE;
use super::handshake::Handshake;
use super::packet::{DataPacket, MAX_DATA_SIZE, PacketId, decode_request, encode_request};
use super::{NetCryptoConfig, NetCryptoError};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, nothing sent yet
    NoConnection,
    /// Waiting for the peer's cookie
    CookieRequesting,
    /// Our handshake is out, the peer's has not arrived
    HandshakeSent,
    /// Session keys agreed, no data packet from the peer yet
    NotConfirmed,
    /// Data flowed from the peer under the session key
    Confirmed,
    /// Silence window or handshake deadline passed
    TimedOut,
    /// Closed by us or the peer, or out of nonces
    Killed,
}

impl ConnectionState {
    /// Session keys in place
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, Self::NotConfirmed | Self::Confirmed)
    }

    /// Terminal state
    #[must_use]
    pub fn is_dead(self) -> bool {
        matches!(self, Self::TimedOut | Self::Killed)
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Handshake never completed
    HandshakeTimeout,
    /// Confirmed connection went silent
    Timeout,
    /// Closed locally
    Killed,
    /// Peer sent a kill packet
    PeerKilled,
    /// Send counter exhausted
    NonceExhausted,
}

/// Per-connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Data packets sealed
    pub packets_sent: u64,
    /// Data packets opened
    pub packets_received: u64,
    /// Bytes of sealed data packets
    pub bytes_sent: u64,
    /// Bytes of opened data packets
    pub bytes_received: u64,
    /// Lossless packets sent again
    pub retransmissions: u64,
    /// Packets whose tag did not verify
    pub decrypt_failures: u64,
    /// Packets with a counter already seen or too old
    pub replays: u64,
    /// Lossless packets beyond the reorder window
    pub out_of_window: u64,
}

/// Something an opened data packet carried for the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// In-order lossless data, id byte first
    Lossless(Vec<u8>),
    /// Lossy data, id byte first
    Lossy(Vec<u8>),
    /// Peer closed the connection
    Kill,
}

/// State of one crypto connection
pub struct CryptoConnection {
    peer_real: PublicKey,
    peer_dht: PublicKey,
    state: ConnectionState,

    session: KeyPair,
    base_nonce: Nonce,
    send_counter: u64,
    peer_session: Option<PublicKey>,
    peer_base_nonce: Option<Nonce>,
    shared: Option<SharedKey>,
    dht_key: Option<SharedKey>,
    peer_cookie: Option<[u8; COOKIE_SIZE]>,
    echo: u64,
    replay: ReplayWindow,

    send_buf: SendBuffer,
    recv_buf: RecvBuffer,
    congestion: Congestion,
    ack_pending: bool,

    udp: Option<SocketAddr>,
    last_udp: Option<Instant>,

    started: Instant,
    last_recv: Instant,
    last_send: Option<Instant>,
    last_attempt: Option<Instant>,
    dead_since: Option<Instant>,
    close_reason: Option<CloseReason>,

    keepalive: Duration,
    retry: Duration,
    udp_timeout: Duration,
    stats: ConnectionStats,
}

impl CryptoConnection {
    /// New connection to `peer_real`, reachable under `peer_dht`
    #[must_use]
    pub fn new(peer_real: PublicKey, peer_dht: PublicKey, config: &NetCryptoConfig, now: Instant) -> Self {
        Self {
            peer_real,
            peer_dht,
            state: ConnectionState::NoConnection,
            session: KeyPair::generate(),
            base_nonce: Nonce::random(),
            send_counter: 0,
            peer_session: None,
            peer_base_nonce: None,
            shared: None,
            dht_key: None,
            peer_cookie: None,
            echo: rand::random(),
            replay: ReplayWindow::with_size(config.replay_window),
            send_buf: SendBuffer::new(config.send_buffer_size),
            recv_buf: RecvBuffer::new(config.recv_buffer_size),
            congestion: Congestion::new(config.congestion.clone()),
            ack_pending: false,
            udp: None,
            last_udp: None,
            started: now,
            last_recv: now,
            last_send: None,
            last_attempt: None,
            dead_since: None,
            close_reason: None,
            keepalive: config.keepalive_interval,
            retry: config.handshake_retry,
            udp_timeout: config.udp_path_timeout,
            stats: ConnectionStats::default(),
        }
    }

    /// Peer's long-term key
    #[must_use]
    pub fn peer_real(&self) -> PublicKey {
        self.peer_real
    }

    /// Peer's DHT key
    #[must_use]
    pub fn peer_dht(&self) -> PublicKey {
        self.peer_dht
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Smoothed round-trip time
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.congestion.rtt()
    }

    /// Congestion window in packets
    #[must_use]
    pub fn congestion_window(&self) -> usize {
        self.congestion.window()
    }

    /// Next send counter
    #[must_use]
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// Lossless packets not yet acknowledged
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.send_buf.len()
    }

    /// Why the connection ended, once dead
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Echo value of our cookie requests
    #[must_use]
    pub fn echo(&self) -> u64 {
        self.echo
    }

    /// Precomputed key between the two DHT keys, used for cookies
    #[must_use]
    pub fn dht_key(&self) -> Option<&SharedKey> {
        self.dht_key.as_ref()
    }

    /// Install the DHT box key for `peer_dht`.
    pub fn set_peer_dht(&mut self, peer_dht: PublicKey, key: SharedKey) {
        self.peer_dht = peer_dht;
        self.dht_key = Some(key);
    }

    /// Cookie the peer made for us, once known
    #[must_use]
    pub fn peer_cookie(&self) -> Option<&[u8; COOKIE_SIZE]> {
        self.peer_cookie.as_ref()
    }

    /// Store a cookie from a cookie response
    pub fn set_peer_cookie(&mut self, cookie: [u8; COOKIE_SIZE]) {
        self.peer_cookie = Some(cookie);
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: ConnectionState) -> bool {
        use ConnectionState::{
            Confirmed, CookieRequesting, HandshakeSent, Killed, NoConnection, NotConfirmed, TimedOut,
        };
        match (self.state, to) {
            (_, TimedOut | Killed) => !self.state.is_dead(),
            (NoConnection, CookieRequesting | HandshakeSent | NotConfirmed) => true,
            (CookieRequesting, HandshakeSent | NotConfirmed) => true,
            (HandshakeSent, NotConfirmed) => true,
            (NotConfirmed, Confirmed) => true,
            _ => false,
        }
    }

    /// Transition to a new state.
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::InvalidState`] if the transition is not
    /// allowed from the current state.
    pub fn transition_to(&mut self, new_state: ConnectionState, now: Instant) -> Result<(), NetCryptoError> {
        if !self.can_transition(new_state) {
            return Err(NetCryptoError::InvalidState {
                from: self.state,
                to: new_state,
            });
        }

        let old_state = self.state;
        self.state = new_state;

        match new_state {
            ConnectionState::CookieRequesting | ConnectionState::HandshakeSent => {
                self.last_attempt = None;
            }
            ConnectionState::NotConfirmed => {
                self.last_recv = now;
            }
            ConnectionState::TimedOut | ConnectionState::Killed => {
                self.dead_since = Some(now);
                self.send_buf.clear();
                self.recv_buf.clear();
                self.shared = None;
            }
            _ => {}
        }

        tracing::debug!(
            "crypto connection {}: {:?} -> {:?}",
            self.peer_real,
            old_state,
            new_state
        );
        Ok(())
    }

    /// Move to a dead state, recording why
    pub fn close(&mut self, reason: CloseReason, now: Instant) {
        let state = match reason {
            CloseReason::HandshakeTimeout | CloseReason::Timeout => ConnectionState::TimedOut,
            _ => ConnectionState::Killed,
        };
        if self.transition_to(state, now).is_ok() {
            self.close_reason = Some(reason);
        }
    }

    /// Whether a handshake-phase retry is due; marks the attempt
    pub fn attempt_due(&mut self, now: Instant) -> bool {
        let due = self.last_attempt.is_none_or(|at| is_timeout(at, self.retry, now));
        if due {
            self.last_attempt = Some(now);
        }
        due
    }

    /// Liveness check. Returns the reason if the connection just died.
    pub fn check_timeouts(
        &mut self,
        handshake_timeout: Duration,
        connection_timeout: Duration,
        now: Instant,
    ) -> Option<CloseReason> {
        let reason = match self.state {
            ConnectionState::Confirmed if is_timeout(self.last_recv, connection_timeout, now) => {
                CloseReason::Timeout
            }
            ConnectionState::NoConnection
            | ConnectionState::CookieRequesting
            | ConnectionState::HandshakeSent
            | ConnectionState::NotConfirmed
                if is_timeout(self.started, handshake_timeout, now) =>
            {
                CloseReason::HandshakeTimeout
            }
            _ => return None,
        };
        self.close(reason, now);
        Some(reason)
    }

    /// Whether a dead connection has outlived `grace`
    #[must_use]
    pub fn is_expired(&self, grace: Duration, now: Instant) -> bool {
        self.dead_since.is_some_and(|at| is_timeout(at, grace, now))
    }

    /// Our handshake contents
    #[must_use]
    pub fn handshake(&self, cookie_for_peer: [u8; COOKIE_SIZE]) -> Handshake {
        Handshake {
            base_nonce: self.base_nonce,
            session: self.session.public(),
            cookie_for_peer,
        }
    }

    /// Take the peer's session key and base nonce from its handshake.
    ///
    /// Returns `false` when the handshake repeats the session already
    /// installed.
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::HandshakeMismatch`] when a confirmed
    /// connection sees a different session, and propagates key agreement
    /// errors.
    pub fn accept_peer_session(&mut self, hs: &Handshake) -> Result<bool, NetCryptoError> {
        if self.peer_session == Some(hs.session) {
            self.peer_cookie = Some(hs.cookie_for_peer);
            return Ok(false);
        }
        if self.state == ConnectionState::Confirmed {
            return Err(NetCryptoError::HandshakeMismatch);
        }
        let shared = SharedKey::precompute(self.session.secret(), &hs.session)?;
        self.shared = Some(shared);
        self.peer_session = Some(hs.session);
        self.peer_base_nonce = Some(hs.base_nonce);
        self.peer_cookie = Some(hs.cookie_for_peer);
        self.replay = ReplayWindow::with_size(self.replay.size());
        self.recv_buf = RecvBuffer::new(self.recv_buf.capacity());
        Ok(true)
    }

    /// Best-known direct address
    #[must_use]
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp
    }

    /// Direct address hint (from the DHT or the host)
    pub fn set_udp_addr(&mut self, addr: SocketAddr) {
        self.udp = Some(addr);
    }

    /// A valid packet arrived over UDP from `addr`
    pub fn on_udp_recv(&mut self, addr: SocketAddr, now: Instant) {
        self.udp = Some(addr);
        self.last_udp = Some(now);
    }

    /// Whether direct UDP carried a valid packet recently
    #[must_use]
    pub fn udp_fresh(&self, now: Instant) -> bool {
        self.last_udp
            .is_some_and(|at| !is_timeout(at, self.udp_timeout, now))
    }

    /// Queue lossless data (`packet_id || body`).
    ///
    /// # Errors
    ///
    /// Returns an error for a bad id, oversize data, a dead connection
    /// or a full send buffer.
    pub fn queue_lossless(&mut self, data: &[u8]) -> Result<u32, NetCryptoError> {
        check_data(data, PacketId::LOSSLESS_START..=PacketId::LOSSLESS_END)?;
        if self.state.is_dead() {
            return Err(NetCryptoError::NotConfirmed);
        }
        self.send_buf
            .push(data.to_vec())
            .ok_or(NetCryptoError::BufferFull)
    }

    /// Seal lossy data for immediate sending.
    ///
    /// # Errors
    ///
    /// Returns an error for a bad id, oversize data, an unconfirmed
    /// connection or an exhausted counter.
    pub fn seal_lossy(&mut self, data: &[u8], now: Instant) -> Result<Vec<u8>, NetCryptoError> {
        check_data(data, PacketId::LOSSY_START..=PacketId::LOSSY_END)?;
        if self.state != ConnectionState::Confirmed {
            return Err(NetCryptoError::NotConfirmed);
        }
        self.seal(self.send_buf.end(), data.to_vec(), now)
    }

    /// Seal a keepalive
    ///
    /// # Errors
    ///
    /// Fails without session keys or with an exhausted counter.
    pub fn seal_padding(&mut self, now: Instant) -> Result<Vec<u8>, NetCryptoError> {
        self.seal(self.send_buf.end(), vec![PacketId::Padding.to_byte()], now)
    }

    /// Seal a kill packet
    ///
    /// # Errors
    ///
    /// Fails without session keys or with an exhausted counter.
    pub fn seal_kill(&mut self, now: Instant) -> Result<Vec<u8>, NetCryptoError> {
        self.seal(self.send_buf.end(), vec![PacketId::Kill.to_byte()], now)
    }

    fn seal(&mut self, packet_number: u32, data: Vec<u8>, now: Instant) -> Result<Vec<u8>, NetCryptoError> {
        if self.send_counter == u64::MAX {
            return Err(CryptoError::NonceOverflow.into());
        }
        let shared = self.shared.as_ref().ok_or(NetCryptoError::NotConfirmed)?;
        let packet = DataPacket {
            buffer_start: self.recv_buf.start(),
            packet_number,
            data,
        }
        .seal(shared, &self.base_nonce, self.send_counter)?;
        self.send_counter += 1;
        self.last_send = Some(now);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.len() as u64;
        Ok(packet)
    }

    /// Verify and decrypt a data packet.
    ///
    /// # Errors
    ///
    /// Returns an error for replays, stale counters, bad tags or a missing
    /// session. None of these change the connection's state.
    pub fn open(&mut self, packet: &[u8], now: Instant) -> Result<DataPacket, NetCryptoError> {
        let counter = DataPacket::peek_counter(packet)?;
        if !self.replay.check(counter) {
            self.stats.replays += 1;
            return Err(NetCryptoError::Replay(counter));
        }
        let (Some(shared), Some(base)) = (self.shared.as_ref(), self.peer_base_nonce.as_ref()) else {
            return Err(NetCryptoError::NotConfirmed);
        };
        let (counter, data) = match DataPacket::open(packet, shared, base) {
            Ok(opened) => opened,
            Err(e) => {
                self.stats.decrypt_failures += 1;
                return Err(e);
            }
        };
        self.replay.accept(counter);
        self.last_recv = now;
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.len() as u64;
        Ok(data)
    }

    /// Apply an opened packet: acknowledgement, retransmission requests
    /// and delivery.
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::BadAck`] if the peer acknowledges packets
    /// never queued.
    pub fn process(&mut self, packet: DataPacket, now: Instant) -> Result<Vec<Received>, NetCryptoError> {
        if !self.send_buf.can_ack(packet.buffer_start) {
            return Err(NetCryptoError::BadAck);
        }
        for (_, slot) in self.send_buf.ack(packet.buffer_start) {
            if let Some(first_sent) = slot.first_sent {
                let rtt = (slot.retransmits == 0).then(|| now.saturating_duration_since(first_sent));
                self.congestion.on_packet_acked(rtt);
            }
        }

        let mut out = Vec::new();
        match packet.id() {
            PacketId::Padding => {}
            PacketId::Request => self.on_request(packet.buffer_start, packet.body(), now),
            PacketId::Kill => out.push(Received::Kill),
            PacketId::Lossless(_) => {
                self.ack_pending = true;
                if self.recv_buf.insert(packet.packet_number, packet.data) == Inserted::TooFar {
                    self.stats.out_of_window += 1;
                }
                while let Some(data) = self.recv_buf.pop() {
                    out.push(Received::Lossless(data));
                }
            }
            PacketId::Lossy(_) => out.push(Received::Lossy(packet.data)),
            PacketId::Reserved(id) => {
                tracing::trace!("ignoring reserved packet id {} from {}", id, self.peer_real);
            }
        }
        Ok(out)
    }

    fn on_request(&mut self, base: u32, bitmap: &[u8], now: Instant) {
        let rtt = self.congestion.rtt();
        let mut lost = false;
        for number in decode_request(base, bitmap) {
            let Some(slot) = self.send_buf.get_mut(number) else {
                continue;
            };
            let stale = slot.last_sent.is_some_and(|at| is_timeout(at, rtt, now));
            if stale && !slot.requested {
                slot.requested = true;
                lost = true;
            }
        }
        if lost {
            self.congestion.on_packet_lost(now);
        }
    }

    /// Seal everything due: requested and timed-out retransmissions, new
    /// packets the window allows, an acknowledgement and a keepalive.
    ///
    /// # Errors
    ///
    /// Returns the first sealing error; an exhausted counter is reported
    /// as [`CryptoError::NonceOverflow`].
    pub fn flush(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, NetCryptoError> {
        if !self.state.is_established() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();

        let rto = self.congestion.rto();
        let mut timed_out = false;
        let mut resend = Vec::new();
        for (number, slot) in self.send_buf.iter_mut() {
            let Some(last) = slot.last_sent else {
                continue;
            };
            if slot.requested || is_timeout(last, rto, now) {
                timed_out |= !slot.requested;
                slot.requested = false;
                resend.push(number);
            }
        }
        if timed_out {
            self.congestion.on_timeout(now);
        }
        for number in resend {
            let Some(data) = self.send_buf.get(number).map(|s| s.data.clone()) else {
                continue;
            };
            let packet = self.seal(number, data, now)?;
            if let Some(slot) = self.send_buf.get_mut(number) {
                slot.last_sent = Some(now);
                slot.retransmits += 1;
            }
            self.stats.retransmissions += 1;
            out.push(packet);
        }

        let budget = self
            .congestion
            .window()
            .saturating_sub(self.congestion.in_flight());
        let fresh: Vec<u32> = self
            .send_buf
            .iter_mut()
            .filter(|(_, slot)| slot.first_sent.is_none())
            .take(budget)
            .map(|(number, _)| number)
            .collect();
        for number in fresh {
            let Some(data) = self.send_buf.get(number).map(|s| s.data.clone()) else {
                continue;
            };
            let packet = self.seal(number, data, now)?;
            if let Some(slot) = self.send_buf.get_mut(number) {
                slot.first_sent = Some(now);
                slot.last_sent = Some(now);
            }
            self.congestion.on_packet_sent();
            out.push(packet);
        }

        if self.ack_pending {
            self.ack_pending = false;
            let missing = self.recv_buf.missing();
            if out.is_empty() || !missing.is_empty() {
                let mut data = vec![PacketId::Request.to_byte()];
                data.extend(encode_request(self.recv_buf.start(), &missing));
                out.push(self.seal(self.send_buf.end(), data, now)?);
            }
        }

        let idle = self.last_send.is_none_or(|at| is_timeout(at, self.keepalive, now));
        if out.is_empty() && idle {
            out.push(self.seal_padding(now)?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn set_send_counter(&mut self, counter: u64) {
        self.send_counter = counter;
    }
}

fn check_data(data: &[u8], ids: std::ops::RangeInclusive<u8>) -> Result<(), NetCryptoError> {
    let Some(&id) = data.first() else {
        return Err(NetCryptoError::InvalidPacketId(0));
    };
    if !ids.contains(&id) {
        return Err(NetCryptoError::InvalidPacketId(id));
    }
    if data.len() - 1 > MAX_DATA_SIZE {
        return Err(NetCryptoError::TooLarge {
            size: data.len() - 1,
            max: MAX_DATA_SIZE,
        });
    }
    Ok(())
}

impl std::fmt::Debug for CryptoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConnection")
            .field("peer", &self.peer_real)
            .field("state", &self.state)
            .field("send_counter", &self.send_counter)
            .field("unacked", &self.send_buf.len())
            .field("cwnd", &self.congestion.window())
            .finish_non_exhaustive()
    }
}
