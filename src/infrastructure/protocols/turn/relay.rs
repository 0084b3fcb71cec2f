//! Relay data path
//!
//! Moves application data between clients and their permitted peers. Each
//! allocation gets one task reading its relay transport; client-to-peer data
//! is forwarded inline by the dispatcher. Data from or to a peer without a
//! live permission is dropped without telling anyone.

use super::allocator::{reusable_socket, PortLease, RelayTransport};
use super::channel_data::ChannelData;
use super::message;
use super::request::{DataConnection, TurnResponse};
use super::tcp_relay::PendingConnections;
use super::transport::{raised, ClientSink, MAX_DATAGRAM_SIZE};
use crate::domain::allocation::{Allocation, AllocationTable};
use crate::domain::shared::{ConnectionId, RelayError, Result, TransportProtocol};
use crate::infrastructure::metrics::{self, Direction};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept so fd exhaustion does not spin the task
pub(super) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub type RelayAllocation = Allocation<RelayTransport>;
pub type RelayTable = AllocationTable<RelayTransport>;

#[derive(Clone)]
pub struct RelayPath {
    table: Arc<RelayTable>,
    pending: Arc<PendingConnections>,
    connect_timeout: Duration,
}

impl RelayPath {
    pub fn new(table: Arc<RelayTable>, pending: Arc<PendingConnections>, connect_timeout: Duration) -> Self {
        Self {
            table,
            pending,
            connect_timeout,
        }
    }

    pub fn table(&self) -> &Arc<RelayTable> {
        &self.table
    }

    pub fn pending(&self) -> &Arc<PendingConnections> {
        &self.pending
    }

    /// Forward datagrams arriving on a UDP relay socket to the client
    pub fn spawn_udp(
        &self,
        allocation: Arc<RelayAllocation>,
        socket: Arc<UdpSocket>,
        lease: PortLease,
        sink: ClientSink,
    ) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut closed = allocation.closed();
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                tokio::select! {
                    _ = raised(&mut closed) => break,
                    _ = tokio::time::sleep_until(allocation.deadline().into()) => {
                        if relay.reclaim_if_expired(&allocation) {
                            break;
                        }
                    }
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((size, peer)) => {
                            let data = Bytes::copy_from_slice(&buf[..size]);
                            if !relay.forward_to_client(&allocation, peer, data, &sink).await {
                                relay.table.remove(allocation.id());
                                break;
                            }
                        }
                        Err(e) => relay.recv_failed(&allocation, &e),
                    },
                }
            }

            relay.finish(&allocation);
            drop(socket);
            drop(lease);
        })
    }

    /// Accept peer connections on a TCP relay listener and announce them
    pub fn spawn_tcp_listener(
        &self,
        allocation: Arc<RelayAllocation>,
        listener: TcpListener,
        lease: PortLease,
        sink: ClientSink,
    ) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut closed = allocation.closed();
            let id = allocation.id();

            loop {
                tokio::select! {
                    _ = raised(&mut closed) => break,
                    _ = tokio::time::sleep_until(allocation.deadline().into()) => {
                        if relay.reclaim_if_expired(&allocation) {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if !relay.table.permissions().is_authorized(id, peer.ip()) {
                                debug!("Refused TCP peer {} on {}: no permission", peer, allocation.relayed_addr());
                                metrics::record_dropped("no_permission");
                                continue;
                            }
                            if !relay.announce(&allocation, peer, stream, &sink).await {
                                relay.table.remove(id);
                                break;
                            }
                        }
                        Err(e) => relay.accept_failed(&allocation, &e).await,
                    },
                }
            }

            relay.pending.remove_allocation(id);
            relay.finish(&allocation);
            drop(listener);
            drop(lease);
        })
    }

    /// Returns false once the client can no longer be reached
    async fn forward_to_client(
        &self,
        allocation: &RelayAllocation,
        peer: SocketAddr,
        data: Bytes,
        sink: &ClientSink,
    ) -> bool {
        let id = allocation.id();
        if allocation.is_expired() {
            debug!("Dropped {} bytes from {} on {}: allocation expired", data.len(), peer, allocation.relayed_addr());
            metrics::record_dropped("expired");
            return true;
        }
        if !self.table.permissions().is_authorized(id, peer.ip()) {
            debug!("Dropped {} bytes from {} on {}: no permission", data.len(), peer, allocation.relayed_addr());
            metrics::record_dropped("no_permission");
            return true;
        }

        let size = data.len();
        let frame = match self.table.channels().resolve_reverse(id, peer) {
            Ok(channel) => ChannelData::new(channel, data).encode(sink.is_stream()),
            Err(_) => message::data_indication(peer, data),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot frame data from {}: {}", peer, e);
                metrics::record_dropped("encode");
                return true;
            }
        };

        match sink.send(frame).await {
            Ok(()) => {
                debug!("Relayed {} bytes {} -> client of {}", size, peer, id);
                metrics::record_relayed(Direction::ToClient, size);
                true
            }
            Err(e) if sink.is_stream() => {
                info!("Client of allocation {} went away: {}", id, e);
                false
            }
            Err(e) => {
                debug!("Lost datagram to client of {}: {}", id, e);
                metrics::record_dropped("client_send");
                true
            }
        }
    }

    async fn announce(
        &self,
        allocation: &RelayAllocation,
        peer: SocketAddr,
        stream: TcpStream,
        sink: &ClientSink,
    ) -> bool {
        let connection_id = self.pending.insert(allocation.id(), peer, stream);
        let indication = match message::connection_attempt(connection_id, peer) {
            Ok(indication) => indication,
            Err(e) => {
                warn!("Cannot encode ConnectionAttempt: {}", e);
                self.pending.take(connection_id);
                return true;
            }
        };
        if let Err(e) = sink.send(indication).await {
            self.pending.take(connection_id);
            info!("Client of allocation {} went away: {}", allocation.id(), e);
            return !sink.is_stream();
        }
        info!("Peer {} connected to {} as connection {}", peer, allocation.relayed_addr(), connection_id);
        true
    }

    /// Remove the allocation once its deadline has really passed
    ///
    /// A refresh may have moved the deadline since the timer was armed.
    fn reclaim_if_expired(&self, allocation: &RelayAllocation) -> bool {
        if !allocation.is_expired() {
            return false;
        }
        info!("Allocation {} on {} expired", allocation.id(), allocation.relayed_addr());
        self.table.remove(allocation.id());
        true
    }

    /// A failed read, such as an ICMP error surfacing, leaves the allocation up
    fn recv_failed(&self, allocation: &RelayAllocation, e: &io::Error) {
        debug!("Receive on relay socket {} failed: {}", allocation.relayed_addr(), e);
        metrics::record_dropped("relay_recv");
    }

    async fn accept_failed(&self, allocation: &RelayAllocation, e: &io::Error) {
        warn!("Accept failed on relay listener {}: {}", allocation.relayed_addr(), e);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
    }

    fn finish(&self, allocation: &RelayAllocation) {
        debug!("Relay task for {} stopped", allocation.id());
        metrics::record_allocation_released(self.table.len(), allocation.created_at().elapsed());
    }

    /// Forward client data to a peer
    ///
    /// Sending refreshes the peer's permission; without one the data is dropped.
    pub async fn send_to_peer(
        &self,
        allocation: &RelayAllocation,
        peer: SocketAddr,
        data: Bytes,
    ) -> Result<TurnResponse> {
        if !self.table.permissions().touch(allocation.id(), peer.ip()) {
            debug!("Dropped {} bytes to {} from {}: no permission", data.len(), peer, allocation.id());
            metrics::record_dropped("no_permission");
            return Ok(TurnResponse::Dropped);
        }

        match allocation.transport() {
            RelayTransport::Udp(socket) => match socket.send_to(&data, peer).await {
                Ok(_) => {
                    metrics::record_relayed(Direction::ToPeer, data.len());
                    Ok(TurnResponse::Relayed)
                }
                Err(e) => {
                    debug!("Lost datagram to {}: {}", peer, e);
                    metrics::record_dropped("peer_send");
                    Ok(TurnResponse::Dropped)
                }
            },
            RelayTransport::Tcp { .. } => {
                debug!("Dropped datagram for TCP allocation {}", allocation.id());
                metrics::record_dropped("tcp_allocation");
                Ok(TurnResponse::Dropped)
            }
        }
    }

    /// Open a relayed TCP connection to a permitted peer
    pub async fn connect_peer(&self, allocation: &RelayAllocation, peer: SocketAddr) -> Result<ConnectionId> {
        let id = allocation.id();
        let RelayTransport::Tcp { local_addr } = allocation.transport() else {
            return Err(RelayError::BadRequest("Connect on a UDP allocation".to_string()));
        };
        if !self.table.permissions().is_authorized(id, peer.ip()) {
            return Err(RelayError::Forbidden(format!("no permission for {}", peer.ip())));
        }
        if self.pending.has_peer(id, peer) {
            return Err(RelayError::ConnectionAlreadyExists(peer.to_string()));
        }

        let stream = tokio::time::timeout(self.connect_timeout, dial(*local_addr, peer))
            .await
            .map_err(|_| RelayError::ConnectionFailure(format!("connect to {} timed out", peer)))?
            .map_err(|e| RelayError::ConnectionFailure(format!("connect to {}: {}", peer, e)))?;

        let connection_id = self.pending.insert(id, peer, stream);
        info!("Connected {} to peer {} as connection {}", allocation.relayed_addr(), peer, connection_id);
        Ok(connection_id)
    }

    /// Claim a pending peer connection for a client data connection
    pub fn bind_connection(&self, connection_id: ConnectionId, username: &str) -> Result<DataConnection> {
        let connection = self
            .pending
            .take(connection_id)
            .ok_or_else(|| RelayError::BadRequest(format!("unknown connection {}", connection_id)))?;
        let allocation = self
            .table
            .get(connection.allocation)
            .ok_or_else(|| RelayError::NotFound(format!("allocation {}", connection.allocation)))?;
        if allocation.protocol() != TransportProtocol::Tcp {
            return Err(RelayError::BadRequest("not a TCP allocation".to_string()));
        }
        if allocation.username() != username {
            return Err(RelayError::WrongCredentials(format!(
                "connection {} belongs to another user",
                connection_id
            )));
        }

        Ok(DataConnection {
            allocation: allocation.id(),
            peer: connection.peer,
            stream: connection.stream,
            closed: allocation.closed(),
        })
    }
}

/// Dial a peer from the relayed address, falling back to an ephemeral port
async fn dial(local: SocketAddr, peer: SocketAddr) -> io::Result<TcpStream> {
    let bound = if local.is_ipv4() == peer.is_ipv4() {
        reusable_socket(local).and_then(|socket| {
            socket.bind(local)?;
            Ok(socket)
        })
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidInput, "address family mismatch"))
    };

    let socket = match bound {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Dialing {} from an ephemeral port: {}", peer, e);
            if peer.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            }
        }
    };
    socket.connect(peer).await
}

/// Copy bytes both ways between a client data connection and its peer
/// until either side closes or the allocation is released
pub async fn splice(mut client: TcpStream, connection: DataConnection) -> io::Result<()> {
    let DataConnection {
        allocation,
        peer,
        stream: mut peer_stream,
        mut closed,
    } = connection;
    info!("Splicing client {} with peer {} for {}", client.peer_addr()?, peer, allocation);

    tokio::select! {
        _ = raised(&mut closed) => {
            debug!("Allocation {} released, closing data connection to {}", allocation, peer);
            Ok(())
        }
        copied = tokio::io::copy_bidirectional(&mut client, &mut peer_stream) => {
            let (to_peer, to_client) = copied?;
            metrics::record_relayed(Direction::ToPeer, to_peer as usize);
            metrics::record_relayed(Direction::ToClient, to_client as usize);
            debug!("Data connection to {} closed ({} bytes out, {} bytes in)", peer, to_peer, to_client);
            Ok(())
        }
    }
}
