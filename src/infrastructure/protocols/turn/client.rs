//! TURN client session
//!
//! One control connection (UDP socket or TCP stream) to a TURN server, with a
//! background reader that matches responses to transactions and hands
//! relayed data to the allocation built on top of it.
//!
//! The session moves `Idle -> Allocating -> Allocated -> Closed`. A failed
//! Allocate goes back to `Idle`; once `Closed` every request fails with
//! [`RelayError::SessionClosed`].

use super::channel_data::ChannelData;
use super::relay_conn::RelaySocket;
use super::tcp_alloc::TcpAllocation;
use super::transport::{read_frame, write_queue, ClientSink, MAX_DATAGRAM_SIZE, STREAM_QUEUE_DEPTH};
use crate::domain::credential::{generate_auth_key, AuthKey};
use crate::domain::shared::{ChannelNumber, ConnectionId, RelayError, Result, TransportProtocol};
use crate::infrastructure::protocols::stun::{Attribute, MessageClass, Method, StunMessage, TransactionId};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth of the inbound data and ConnectionAttempt queues
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Lifetime assumed when a response carries no LIFETIME
const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub username: String,
    pub password: String,
    /// Used until the server names its realm in a challenge
    pub realm: String,
    /// Transport of the control connection
    pub transport: TransportProtocol,
    pub software: Option<String>,
    /// Initial retransmission timeout on UDP, doubled after each attempt
    pub rto: Duration,
    /// Transmissions of one UDP request, the first included
    pub max_transmissions: u32,
    /// Hard limit for one transaction on any transport
    pub transaction_timeout: Duration,
    /// Bind a channel to every peer before sending to it
    pub channel_mode: bool,
    /// Requested allocation lifetime; server default when unset
    pub lifetime: Option<Duration>,
}

impl ClientConfig {
    pub fn new(
        server: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            server,
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
            transport: TransportProtocol::Udp,
            software: Some(concat!("turnkey/", env!("CARGO_PKG_VERSION")).to_string()),
            rto: Duration::from_millis(200),
            max_transmissions: 7,
            transaction_timeout: Duration::from_secs(30),
            channel_mode: false,
            lifetime: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Allocating,
    Allocated,
    Closed,
}

/// Realm, nonce and key learned from the server's last challenge
#[derive(Debug, Clone)]
struct SessionCredentials {
    realm: String,
    nonce: String,
    key: AuthKey,
}

/// Routes frames read from the control connection
struct Demux {
    transactions: DashMap<TransactionId, oneshot::Sender<StunMessage>>,
    channels: DashMap<ChannelNumber, SocketAddr>,
    data_tx: mpsc::Sender<(SocketAddr, Bytes)>,
    attempts_tx: mpsc::Sender<(ConnectionId, SocketAddr)>,
}

impl Demux {
    fn dispatch(&self, frame: &[u8]) {
        if ChannelData::is_channel_data(frame) {
            match ChannelData::decode(frame) {
                Ok(channel_data) => match self.channels.get(&channel_data.channel).map(|peer| *peer) {
                    Some(peer) => self.deliver(peer, channel_data.data),
                    None => debug!("ChannelData on unknown channel {}", channel_data.channel),
                },
                Err(e) => debug!("Malformed ChannelData: {}", e),
            }
            return;
        }

        let message = match StunMessage::from_bytes(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Discarding {} bytes from server: {}", frame.len(), e);
                return;
            }
        };

        match (message.class(), message.method()) {
            (MessageClass::Indication, Method::Data) => {
                match (message.get_xor_peer_address(), message.get_data()) {
                    (Some(peer), Some(data)) => self.deliver(peer, data.clone()),
                    _ => debug!("Data indication without peer or data"),
                }
            }
            (MessageClass::Indication, Method::ConnectionAttempt) => {
                match (message.get_connection_id(), message.get_xor_peer_address()) {
                    (Some(id), Some(peer)) => {
                        if self.attempts_tx.try_send((ConnectionId::new(id), peer)).is_err() {
                            warn!("Dropped ConnectionAttempt from {}", peer);
                        }
                    }
                    _ => debug!("ConnectionAttempt without id or peer"),
                }
            }
            (MessageClass::SuccessResponse | MessageClass::ErrorResponse, _) => {
                match self.transactions.remove(&message.transaction_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(message);
                    }
                    None => debug!("Response to unknown transaction {}", hex::encode(message.transaction_id)),
                }
            }
            _ => debug!("Ignoring {}", message),
        }
    }

    fn deliver(&self, peer: SocketAddr, data: Bytes) {
        if self.data_tx.try_send((peer, data)).is_err() {
            debug!("Inbound data from {} dropped, reader not keeping up", peer);
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    sink: ClientSink,
    local_addr: SocketAddr,
    demux: Arc<Demux>,
    credentials: RwLock<Option<SessionCredentials>>,
    state: watch::Sender<SessionState>,
    data_rx: Mutex<Option<mpsc::Receiver<(SocketAddr, Bytes)>>>,
    attempts_rx: Mutex<Option<mpsc::Receiver<(ConnectionId, SocketAddr)>>>,
    reader: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Handle to a client session; clones share the session
#[derive(Clone)]
pub struct TurnClient {
    inner: Arc<ClientInner>,
}

impl TurnClient {
    /// Open the control connection and start the background reader
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (data_tx, data_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (attempts_tx, attempts_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let demux = Arc::new(Demux {
            transactions: DashMap::new(),
            channels: DashMap::new(),
            data_tx,
            attempts_tx,
        });

        let (sink, local_addr, reader) = match config.transport {
            TransportProtocol::Udp => {
                let bind: SocketAddr = if config.server.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = Arc::new(UdpSocket::bind(bind).await?);
                let local_addr = socket.local_addr()?;
                let reader = tokio::spawn(read_datagrams(Arc::clone(&socket), config.server, Arc::clone(&demux)));
                let sink = ClientSink::Udp {
                    socket,
                    client: config.server,
                };
                (sink, local_addr, reader)
            }
            TransportProtocol::Tcp => {
                let stream = TcpStream::connect(config.server).await?;
                let local_addr = stream.local_addr()?;
                let (reader_half, writer_half) = stream.into_split();
                let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
                tokio::spawn(write_queue(writer_half, rx));
                let reader = tokio::spawn(read_stream(reader_half, Arc::clone(&demux)));
                (ClientSink::Stream(tx), local_addr, reader)
            }
        };

        info!(
            "TURN client {} connected to {} over {}",
            local_addr, config.server, config.transport
        );
        let (state, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                sink,
                local_addr,
                demux,
                credentials: RwLock::new(None),
                state,
                data_rx: Mutex::new(Some(data_rx)),
                attempts_rx: Mutex::new(Some(attempts_rx)),
                reader,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Local address of the control connection
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.config.server
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Learn the reflexive address the server sees
    pub async fn send_binding_request(&self) -> Result<SocketAddr> {
        let response = self.request(Method::Binding, Vec::new(), false).await?;
        response
            .get_xor_mapped_address()
            .or_else(|| response.get_mapped_address())
            .ok_or_else(|| RelayError::Codec("Binding response without mapped address".to_string()))
    }

    /// Allocate a UDP relay
    pub async fn allocate(&self) -> Result<RelaySocket> {
        let (relayed_addr, lifetime) = self.allocate_with(TransportProtocol::Udp).await?;
        let data_rx = self
            .inner
            .data_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::InvalidStateTransition("relay data already claimed".to_string()))?;
        Ok(RelaySocket::new(self.clone(), relayed_addr, lifetime, data_rx))
    }

    /// Allocate a TCP relay; needs a TCP control connection
    pub async fn allocate_tcp(&self) -> Result<TcpAllocation> {
        if self.inner.config.transport != TransportProtocol::Tcp {
            return Err(RelayError::BadRequest(
                "TCP allocations need a TCP control connection".to_string(),
            ));
        }
        let (relayed_addr, lifetime) = self.allocate_with(TransportProtocol::Tcp).await?;
        let attempts_rx = self
            .inner
            .attempts_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::InvalidStateTransition("connection attempts already claimed".to_string()))?;
        Ok(TcpAllocation::new(self.clone(), relayed_addr, lifetime, attempts_rx))
    }

    async fn allocate_with(&self, protocol: TransportProtocol) -> Result<(SocketAddr, Duration)> {
        self.transition(&[SessionState::Idle], SessionState::Allocating)?;

        let mut attributes = vec![Attribute::RequestedTransport(protocol.protocol_number())];
        if let Some(lifetime) = self.inner.config.lifetime {
            attributes.push(Attribute::Lifetime(lifetime_secs(lifetime)));
        }

        let allocated = match self.request(Method::Allocate, attributes, true).await {
            Ok(response) => response
                .get_xor_relayed_address()
                .map(|relayed| (relayed, response_lifetime(&response)))
                .ok_or_else(|| RelayError::Codec("Allocate response without XOR-RELAYED-ADDRESS".to_string())),
            Err(e) => Err(e),
        };

        match allocated {
            Ok((relayed_addr, lifetime)) => {
                self.transition(&[SessionState::Allocating], SessionState::Allocated)?;
                info!("Allocated {} relay {} for {}s", protocol, relayed_addr, lifetime.as_secs());
                Ok((relayed_addr, lifetime))
            }
            Err(e) => {
                let _ = self.transition(&[SessionState::Allocating], SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Install or refresh permissions for the IPs of `peers`
    pub async fn create_permission(&self, peers: &[SocketAddr]) -> Result<()> {
        self.ensure_allocated()?;
        let attributes = peers.iter().map(|peer| Attribute::XorPeerAddress(*peer)).collect();
        self.request(Method::CreatePermission, attributes, true).await?;
        debug!("Permission installed for {:?}", peers);
        Ok(())
    }

    /// Bind (or refresh) a channel to a peer
    pub async fn channel_bind(&self, channel: ChannelNumber, peer: SocketAddr) -> Result<()> {
        self.ensure_allocated()?;
        self.request(
            Method::ChannelBind,
            vec![
                Attribute::ChannelNumber(channel.value()),
                Attribute::XorPeerAddress(peer),
            ],
            true,
        )
        .await?;
        self.inner.demux.channels.insert(channel, peer);
        debug!("Channel {} bound to {}", channel, peer);
        Ok(())
    }

    /// Refresh the allocation; a zero lifetime deletes it and closes the session
    pub async fn refresh(&self, lifetime: Option<Duration>) -> Result<Duration> {
        self.ensure_allocated()?;
        let attributes = lifetime
            .map(|lifetime| vec![Attribute::Lifetime(lifetime_secs(lifetime))])
            .unwrap_or_default();
        let result = self.request(Method::Refresh, attributes, true).await;

        if lifetime == Some(Duration::ZERO) {
            self.inner.state.send_replace(SessionState::Closed);
            info!("Allocation deleted, session closed");
        }
        let response = result?;
        Ok(response_lifetime(&response))
    }

    /// Send data to a peer in a Send indication
    pub async fn send_indication(&self, peer: SocketAddr, data: Bytes) -> Result<()> {
        self.ensure_allocated()?;
        let indication = StunMessage::new_indication(Method::Send)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(data));
        self.inner.sink.send(Bytes::from(indication.encode(None)?)).await
    }

    /// Send data over a bound channel
    pub async fn send_channel_data(&self, channel: ChannelNumber, data: Bytes) -> Result<()> {
        self.ensure_allocated()?;
        let frame = ChannelData::new(channel, data).encode(self.inner.sink.is_stream())?;
        self.inner.sink.send(frame).await
    }

    /// Ask the server to open a TCP connection to a peer
    pub async fn connect_peer(&self, peer: SocketAddr) -> Result<ConnectionId> {
        self.ensure_allocated()?;
        let response = self
            .request(Method::Connect, vec![Attribute::XorPeerAddress(peer)], true)
            .await?;
        response
            .get_connection_id()
            .map(ConnectionId::new)
            .ok_or_else(|| RelayError::Codec("Connect response without CONNECTION-ID".to_string()))
    }

    /// Open a data connection and bind it to a pending peer connection
    ///
    /// The returned stream carries raw peer bytes.
    pub async fn connection_bind(&self, connection_id: ConnectionId) -> Result<TcpStream> {
        self.ensure_allocated()?;
        let mut retried_stale = false;

        loop {
            let mut stream = TcpStream::connect(self.inner.config.server).await?;
            let mut message = StunMessage::new_request(Method::ConnectionBind)
                .with(Attribute::ConnectionId(connection_id.value()));
            let key = self.sign(&mut message).await;
            stream
                .write_all(&message.encode(key.as_ref().map(|key| &key[..]))?)
                .await?;

            let frame = tokio::time::timeout(self.inner.config.transaction_timeout, read_frame(&mut stream))
                .await
                .map_err(|_| RelayError::Timeout)??
                .ok_or(RelayError::SessionClosed)?;
            let response = StunMessage::from_bytes(&frame)?;
            if response.transaction_id != message.transaction_id {
                return Err(RelayError::Codec("ConnectionBind answered out of order".to_string()));
            }

            match response.class() {
                MessageClass::SuccessResponse => {
                    debug!("Data connection bound to connection {}", connection_id);
                    return Ok(stream);
                }
                MessageClass::ErrorResponse => {
                    let (code, reason) = error_code(&response);
                    if code == 438 && !retried_stale {
                        retried_stale = true;
                        self.adopt_challenge(&response).await?;
                        continue;
                    }
                    return Err(RelayError::from_error_code(code, &reason));
                }
                _ => return Err(RelayError::Codec(format!("unexpected {}", response.message_type))),
            }
        }
    }

    /// Close the session without contacting the server
    pub fn close(&self) {
        if self.inner.state.send_replace(SessionState::Closed) != SessionState::Closed {
            info!("TURN client {} closed", self.inner.local_addr);
        }
        self.inner.demux.transactions.clear();
        self.inner.reader.abort();
    }

    /// Run one request, answering an authentication challenge when needed
    async fn request(&self, method: Method, attributes: Vec<Attribute>, authenticate: bool) -> Result<StunMessage> {
        let mut retried_unauthorized = false;
        let mut retried_stale = false;

        loop {
            self.ensure_open()?;
            let mut message = StunMessage::new_request(method);
            for attribute in &attributes {
                message.add(attribute.clone());
            }
            if let Some(software) = &self.inner.config.software {
                message.add(Attribute::Software(software.clone()));
            }
            let key = if authenticate { self.sign(&mut message).await } else { None };

            let response = self.transact(&message, key.as_ref().map(|key| &key[..])).await?;
            match response.class() {
                MessageClass::SuccessResponse => {
                    if let Some(key) = key {
                        if response.has_integrity() && !response.verify_integrity(&key) {
                            return Err(RelayError::Unauthorized(
                                "response failed the integrity check".to_string(),
                            ));
                        }
                    }
                    return Ok(response);
                }
                MessageClass::ErrorResponse => {
                    let (code, reason) = error_code(&response);
                    match code {
                        401 if authenticate && !retried_unauthorized => {
                            retried_unauthorized = true;
                            self.adopt_challenge(&response).await?;
                        }
                        438 if authenticate && !retried_stale => {
                            retried_stale = true;
                            self.adopt_challenge(&response).await?;
                        }
                        _ => {
                            debug!("{} failed with {} {}", method.as_str(), code, reason);
                            return Err(RelayError::from_error_code(code, &reason));
                        }
                    }
                }
                _ => return Err(RelayError::Codec(format!("unexpected {}", response.message_type))),
            }
        }
    }

    async fn transact(&self, message: &StunMessage, key: Option<&[u8]>) -> Result<StunMessage> {
        let bytes = Bytes::from(message.encode(key)?);
        let (tx, mut rx) = oneshot::channel();
        self.inner.demux.transactions.insert(message.transaction_id, tx);
        debug!("-> {} {}", self.inner.config.server, message);

        let outcome = tokio::time::timeout(
            self.inner.config.transaction_timeout,
            self.exchange(bytes, &mut rx),
        )
        .await;
        self.inner.demux.transactions.remove(&message.transaction_id);

        let response = outcome.map_err(|_| RelayError::Timeout)??;
        debug!("<- {} {}", self.inner.config.server, response);
        Ok(response)
    }

    async fn exchange(&self, bytes: Bytes, rx: &mut oneshot::Receiver<StunMessage>) -> Result<StunMessage> {
        if self.inner.sink.is_stream() {
            self.inner.sink.send(bytes).await?;
            return rx.await.map_err(|_| RelayError::SessionClosed);
        }

        let mut rto = self.inner.config.rto;
        for _ in 0..self.inner.config.max_transmissions.max(1) {
            self.inner.sink.send(bytes.clone()).await?;
            match tokio::time::timeout(rto, &mut *rx).await {
                Ok(response) => return response.map_err(|_| RelayError::SessionClosed),
                Err(_) => rto *= 2,
            }
        }
        Err(RelayError::Timeout)
    }

    /// Add USERNAME, REALM and NONCE once the server has challenged us
    async fn sign(&self, message: &mut StunMessage) -> Option<AuthKey> {
        let credentials = self.inner.credentials.read().await;
        let credentials = credentials.as_ref()?;
        message.add(Attribute::Username(self.inner.config.username.clone()));
        message.add(Attribute::Realm(credentials.realm.clone()));
        message.add(Attribute::Nonce(credentials.nonce.clone()));
        Some(credentials.key)
    }

    async fn adopt_challenge(&self, response: &StunMessage) -> Result<()> {
        let nonce = response
            .get_nonce()
            .ok_or_else(|| RelayError::Unauthorized("challenge without NONCE".to_string()))?;
        let realm = response.get_realm().unwrap_or(&self.inner.config.realm);
        let key = generate_auth_key(&self.inner.config.username, realm, &self.inner.config.password);

        *self.inner.credentials.write().await = Some(SessionCredentials {
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            key,
        });
        debug!("Adopted challenge for realm {}", realm);
        Ok(())
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> Result<()> {
        let mut current = to;
        let moved = self.inner.state.send_if_modified(|state| {
            current = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        match (moved, current) {
            (true, _) => Ok(()),
            (false, SessionState::Closed) => Err(RelayError::SessionClosed),
            (false, current) => Err(RelayError::InvalidStateTransition(format!(
                "{:?} -> {:?}",
                current, to
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Closed => Err(RelayError::SessionClosed),
            _ => Ok(()),
        }
    }

    fn ensure_allocated(&self) -> Result<()> {
        match self.state() {
            SessionState::Allocated => Ok(()),
            SessionState::Closed => Err(RelayError::SessionClosed),
            state => Err(RelayError::InvalidStateTransition(format!(
                "no allocation ({:?})",
                state
            ))),
        }
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, server: SocketAddr, demux: Arc<Demux>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((size, from)) if from == server => demux.dispatch(&buf[..size]),
            Ok((_, from)) => debug!("Ignoring datagram from {}", from),
            Err(e) => {
                warn!("Client socket receive failed: {}", e);
                break;
            }
        }
    }
    demux.transactions.clear();
}

async fn read_stream(mut reader: tokio::net::tcp::OwnedReadHalf, demux: Arc<Demux>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => demux.dispatch(&frame),
            Ok(None) => {
                info!("Server closed the control connection");
                break;
            }
            Err(e) => {
                warn!("Control connection failed: {}", e);
                break;
            }
        }
    }
    demux.transactions.clear();
}

fn error_code(response: &StunMessage) -> (u16, String) {
    response
        .get_error_code()
        .map(|(code, reason)| (code, reason.to_string()))
        .unwrap_or((500, "missing ERROR-CODE".to_string()))
}

fn response_lifetime(response: &StunMessage) -> Duration {
    response
        .get_lifetime()
        .map(|secs| Duration::from_secs(u64::from(secs)))
        .unwrap_or(DEFAULT_LIFETIME)
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}
