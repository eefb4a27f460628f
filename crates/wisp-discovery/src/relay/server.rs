//! Relay server.
//!
//! [`RelayHub`] holds all routing state and never touches a socket.
//! [`RelayServer`] accepts TCP connections and pumps bytes through the hub.

use super::protocol::{
    CLIENT_HANDSHAKE_SIZE, ConnectionId, FrameCodec, MAX_ROUTES, RelayError, RelayMessage,
    accept_handshake,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use wisp_crypto::{KeyPair, PublicKey};

/// Server-assigned id of one TCP connection
pub type ClientId = u64;

/// Simple rate limiter
#[derive(Debug)]
struct RateLimiter {
    /// Frames per client per window
    limit: usize,
    counts: HashMap<PublicKey, (Instant, usize)>,
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
            window,
        }
    }

    fn check(&mut self, key: PublicKey, now: Instant) -> bool {
        let entry = self.counts.entry(key).or_insert((now, 0));

        if now.saturating_duration_since(entry.0) >= self.window {
            entry.0 = now;
            entry.1 = 0;
        }

        if entry.1 >= self.limit {
            return false;
        }

        entry.1 += 1;
        true
    }

    fn cleanup(&mut self, now: Instant) {
        let window = self.window;
        self.counts
            .retain(|_, (time, _)| now.saturating_duration_since(*time) < window * 2);
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent connections
    pub max_clients: usize,
    /// Forwarded frames per client per second
    pub rate_limit: usize,
    /// Silence after which a client is dropped
    pub client_timeout: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            rate_limit: 100,
            client_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Hub counters
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Data frames forwarded between routes
    pub frames_forwarded: u64,
    /// Out-of-band frames forwarded
    pub oob_forwarded: u64,
    /// Frames dropped (no route, peer offline)
    pub frames_dropped: u64,
    /// Frames refused by the rate limiter
    pub rate_limited: u64,
    /// Hellos that did not open
    pub handshakes_failed: u64,
    /// Clients dropped for silence
    pub timeouts: u64,
}

#[derive(Debug)]
struct Client {
    key: Option<PublicKey>,
    codec: Option<FrameCodec>,
    hello: Vec<u8>,
    /// Slot index is the connection id on this client's link
    routes: Vec<Option<PublicKey>>,
    last_seen: Instant,
}

impl Client {
    fn new(now: Instant) -> Self {
        Self {
            key: None,
            codec: None,
            hello: Vec::with_capacity(CLIENT_HANDSHAKE_SIZE),
            routes: vec![None; MAX_ROUTES],
            last_seen: now,
        }
    }

    fn slot_for(&self, key: &PublicKey) -> Option<ConnectionId> {
        self.routes
            .iter()
            .position(|r| r.as_ref() == Some(key))
            .and_then(|i| ConnectionId::try_from(i).ok())
    }

    fn free_slot(&self) -> Option<ConnectionId> {
        self.routes
            .iter()
            .position(Option::is_none)
            .and_then(|i| ConnectionId::try_from(i).ok())
    }

    fn route(&self, connection_id: ConnectionId) -> Option<PublicKey> {
        self.routes.get(usize::from(connection_id)).copied().flatten()
    }
}

/// Routing state of a relay server.
#[derive(Debug)]
pub struct RelayHub {
    identity: KeyPair,
    config: RelayServerConfig,
    clients: HashMap<ClientId, Client>,
    by_key: HashMap<PublicKey, ClientId>,
    limiter: RateLimiter,
    outbox: VecDeque<(ClientId, Vec<u8>)>,
    closing: VecDeque<ClientId>,
    stats: HubStats,
}

impl RelayHub {
    /// Create a hub answering hellos with `identity`
    #[must_use]
    pub fn new(identity: KeyPair, config: RelayServerConfig) -> Self {
        Self {
            identity,
            limiter: RateLimiter::new(config.rate_limit, Duration::from_secs(1)),
            config,
            clients: HashMap::new(),
            by_key: HashMap::new(),
            outbox: VecDeque::new(),
            closing: VecDeque::new(),
            stats: HubStats::default(),
        }
    }

    /// Relay long-term key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.identity.public()
    }

    /// Clients that finished the handshake
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.by_key.len()
    }

    /// Open connections, including those still handshaking
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether `key` is connected
    #[must_use]
    pub fn is_connected(&self, key: &PublicKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &HubStats {
        &self.stats
    }

    /// Register a new TCP connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ServerFull`] at capacity.
    pub fn accept(&mut self, id: ClientId, now: Instant) -> Result<(), RelayError> {
        if self.clients.len() >= self.config.max_clients {
            return Err(RelayError::ServerFull);
        }
        self.clients.insert(id, Client::new(now));
        Ok(())
    }

    /// Feed bytes read from connection `id`.
    ///
    /// # Errors
    ///
    /// Any error closes the connection; it is queued on
    /// [`RelayHub::poll_close`].
    pub fn handle_bytes(&mut self, id: ClientId, data: &[u8], now: Instant) -> Result<(), RelayError> {
        let result = self.process(id, data, now);
        if let Err(e) = &result {
            if !matches!(e, RelayError::UnknownConnection(_)) {
                tracing::debug!("relay client {} closed: {}", id, e);
                self.close(id);
            }
        }
        result
    }

    fn process(&mut self, id: ClientId, data: &[u8], now: Instant) -> Result<(), RelayError> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection(id))?;
        client.last_seen = now;

        let mut data = data;
        if client.codec.is_none() {
            let take = (CLIENT_HANDSHAKE_SIZE - client.hello.len()).min(data.len());
            client.hello.extend_from_slice(&data[..take]);
            data = &data[take..];
            if client.hello.len() < CLIENT_HANDSHAKE_SIZE {
                return Ok(());
            }
            let hello = std::mem::take(&mut client.hello);
            let (key, codec, reply) = accept_handshake(&self.identity, &hello).inspect_err(|_| {
                self.stats.handshakes_failed += 1;
            })?;
            self.register(id, key, codec, reply);
        }

        let key = self.client_key(id)?;
        self.codec_mut(id)?.push(data);
        loop {
            let Some(msg) = self.codec_mut(id)?.decode()? else {
                return Ok(());
            };
            self.handle_message(id, key, msg, now)?;
        }
    }

    fn register(&mut self, id: ClientId, key: PublicKey, codec: FrameCodec, reply: Vec<u8>) {
        if let Some(old) = self.by_key.get(&key).copied() {
            tracing::debug!("{} reconnected, dropping connection {}", key, old);
            self.close(old);
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.key = Some(key);
            client.codec = Some(codec);
        }
        self.by_key.insert(key, id);
        self.outbox.push_back((id, reply));
        tracing::debug!("relay client {} registered as {}", id, key);
    }

    fn handle_message(
        &mut self,
        id: ClientId,
        key: PublicKey,
        msg: RelayMessage,
        now: Instant,
    ) -> Result<(), RelayError> {
        match msg {
            RelayMessage::RouteRequest { key: target } => self.handle_route_request(id, key, target)?,
            RelayMessage::DisconnectNotification { connection_id } => {
                let client = self
                    .clients
                    .get_mut(&id)
                    .ok_or(RelayError::UnknownConnection(id))?;
                let Some(slot) = client.routes.get_mut(usize::from(connection_id)) else {
                    return Ok(());
                };
                let target = slot.take();
                if let Some(target) = target {
                    self.notify_disconnect(&target, &key);
                }
            }
            RelayMessage::Ping { ping_id } => self.send_to(id, &RelayMessage::Pong { ping_id }),
            RelayMessage::Pong { .. } => {}
            RelayMessage::OobSend {
                key: target,
                payload,
            } => {
                if !self.limiter.check(key, now) {
                    self.stats.rate_limited += 1;
                    return Ok(());
                }
                match self.by_key.get(&target).copied() {
                    Some(target_id) => {
                        self.stats.oob_forwarded += 1;
                        self.send_to(
                            target_id,
                            &RelayMessage::OobRecv {
                                sender: key,
                                payload,
                            },
                        );
                    }
                    None => self.stats.frames_dropped += 1,
                }
            }
            RelayMessage::Data {
                connection_id,
                payload,
            } => {
                if !self.limiter.check(key, now) {
                    self.stats.rate_limited += 1;
                    return Ok(());
                }
                let target = self.clients.get(&id).and_then(|c| c.route(connection_id));
                match target.and_then(|t| self.online_slot(&t, &key)) {
                    Some((target_id, slot)) => {
                        self.stats.frames_forwarded += 1;
                        self.send_to(
                            target_id,
                            &RelayMessage::Data {
                                connection_id: slot,
                                payload,
                            },
                        );
                    }
                    None => self.stats.frames_dropped += 1,
                }
            }
            other => tracing::debug!("relay client {} sent {}", id, other.message_type()),
        }
        Ok(())
    }

    fn handle_route_request(
        &mut self,
        id: ClientId,
        key: PublicKey,
        target: PublicKey,
    ) -> Result<(), RelayError> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection(id))?;
        let slot = if target == key {
            None
        } else if let Some(existing) = client.slot_for(&target) {
            Some(existing)
        } else {
            let free = client.free_slot();
            if let Some(slot) = free {
                client.routes[usize::from(slot)] = Some(target);
            }
            free
        };
        self.send_to(
            id,
            &RelayMessage::RouteResponse {
                connection_id: slot,
                key: target,
            },
        );

        if let (Some(slot), Some((target_id, back))) = (slot, self.online_slot(&target, &key)) {
            self.send_to(id, &RelayMessage::ConnectNotification { connection_id: slot });
            self.send_to(target_id, &RelayMessage::ConnectNotification { connection_id: back });
        }
        Ok(())
    }

    /// Connection of `target` and its slot for `from`, if both exist
    fn online_slot(&self, target: &PublicKey, from: &PublicKey) -> Option<(ClientId, ConnectionId)> {
        let target_id = *self.by_key.get(target)?;
        let slot = self.clients.get(&target_id)?.slot_for(from)?;
        Some((target_id, slot))
    }

    fn notify_disconnect(&mut self, target: &PublicKey, from: &PublicKey) {
        if let Some((target_id, slot)) = self.online_slot(target, from) {
            self.send_to(target_id, &RelayMessage::DisconnectNotification { connection_id: slot });
        }
    }

    /// The TCP connection went away
    pub fn disconnect(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        let Some(key) = client.key else {
            return;
        };
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
        for target in client.routes.iter().flatten() {
            self.notify_disconnect(target, &key);
        }
        tracing::debug!("relay client {} ({}) disconnected", id, key);
    }

    fn close(&mut self, id: ClientId) {
        if self.clients.contains_key(&id) {
            self.disconnect(id);
            self.closing.push_back(id);
        }
    }

    /// Drop silent clients
    pub fn iterate(&mut self, now: Instant) {
        let timeout = self.config.client_timeout;
        let silent: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in silent {
            self.stats.timeouts += 1;
            self.close(id);
        }
        self.limiter.cleanup(now);
    }

    /// Bytes to write to connection `id`
    pub fn poll_transmit(&mut self) -> Option<(ClientId, Vec<u8>)> {
        self.outbox.pop_front()
    }

    /// Connection the host should shut down
    pub fn poll_close(&mut self) -> Option<ClientId> {
        self.closing.pop_front()
    }

    fn client_key(&self, id: ClientId) -> Result<PublicKey, RelayError> {
        self.clients
            .get(&id)
            .and_then(|c| c.key)
            .ok_or(RelayError::UnknownConnection(id))
    }

    fn codec_mut(&mut self, id: ClientId) -> Result<&mut FrameCodec, RelayError> {
        self.clients
            .get_mut(&id)
            .and_then(|c| c.codec.as_mut())
            .ok_or(RelayError::UnknownConnection(id))
    }

    fn send_to(&mut self, id: ClientId, msg: &RelayMessage) {
        let Some(codec) = self.clients.get_mut(&id).and_then(|c| c.codec.as_mut()) else {
            return;
        };
        match codec.encode(msg) {
            Ok(frame) => self.outbox.push_back((id, frame)),
            Err(e) => {
                tracing::warn!("relay client {}: cannot encode {}: {}", id, msg.message_type(), e);
                self.close(id);
            }
        }
    }
}

enum Inbound {
    Bytes(ClientId, Vec<u8>),
    Closed(ClientId),
}

struct Connection {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// TCP relay server
pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<Mutex<RelayHub>>,
    cleanup_interval: Duration,
}

impl RelayServer {
    /// Bind a relay server with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr, identity: KeyPair) -> Result<Self, RelayError> {
        Self::bind_with_config(bind_addr, identity, RelayServerConfig::default()).await
    }

    /// Bind a relay server.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        identity: KeyPair,
        config: RelayServerConfig,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            cleanup_interval: config.cleanup_interval,
            hub: Arc::new(Mutex::new(RelayHub::new(identity, config))),
        })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be read from the socket.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the hub, e.g. for counters
    #[must_use]
    pub fn hub(&self) -> Arc<Mutex<RelayHub>> {
        Arc::clone(&self.hub)
    }

    /// Get number of registered clients
    pub async fn client_count(&self) -> usize {
        self.hub.lock().await.client_count()
    }

    /// Run the relay server.
    ///
    /// # Errors
    ///
    /// Returns only if reading the bound address fails; accept errors are
    /// logged and the loop continues.
    pub async fn run(self) -> Result<(), RelayError> {
        let key = self.hub.lock().await.public_key();
        tracing::info!("relay listening on {} (key {})", self.local_addr()?, key);

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(1024);
        let mut connections: HashMap<ClientId, Connection> = HashMap::new();
        let mut next_id: ClientId = 0;
        let mut cleanup = tokio::time::interval(self.cleanup_interval);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        if let Err(e) = self.hub.lock().await.accept(next_id, Instant::now()) {
                            tracing::debug!("refusing {}: {}", peer, e);
                            continue;
                        }
                        connections.insert(next_id, spawn_connection(next_id, stream, inbound_tx.clone()));
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                },
                Some(inbound) = inbound_rx.recv() => {
                    let mut hub = self.hub.lock().await;
                    match inbound {
                        Inbound::Bytes(id, bytes) => {
                            if let Err(e) = hub.handle_bytes(id, &bytes, Instant::now()) {
                                tracing::trace!("client {}: {}", id, e);
                            }
                        }
                        Inbound::Closed(id) => {
                            hub.disconnect(id);
                            connections.remove(&id);
                        }
                    }
                },
                _ = cleanup.tick() => self.hub.lock().await.iterate(Instant::now()),
            }

            let mut hub = self.hub.lock().await;
            while let Some((id, bytes)) = hub.poll_transmit() {
                if let Some(conn) = connections.get(&id) {
                    let _ = conn.writer.send(bytes);
                }
            }
            while let Some(id) = hub.poll_close() {
                if let Some(conn) = connections.remove(&id) {
                    conn.reader.abort();
                }
            }
        }
    }
}

fn spawn_connection(id: ClientId, stream: TcpStream, inbound: mpsc::Sender<Inbound>) -> Connection {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }
    let (read_half, write_half) = stream.into_split();
    let (writer, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, rx));
    let reader = tokio::spawn(read_loop(id, read_half, inbound));
    Connection { writer, reader }
}

async fn read_loop(id: ClientId, mut stream: OwnedReadHalf, inbound: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if inbound.send(Inbound::Bytes(id, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = inbound.send(Inbound::Closed(id)).await;
}

async fn write_loop(mut stream: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if stream.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
}
