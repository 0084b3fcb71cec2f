//! TURN server front-end
//!
//! Binds the client-facing listener, wires the allocation table, registries
//! and handler together, and runs the sweep tasks.

use super::allocator::PortRangeAllocator;
use super::auth::Authenticator;
use super::handler::TurnHandler;
use super::relay::{splice, RelayPath, ACCEPT_BACKOFF};
use super::request::RequestContext;
use super::tcp_relay::PendingConnections;
use super::transport::{raised, read_frame, write_queue, ClientSink, MAX_DATAGRAM_SIZE, STREAM_QUEUE_DEPTH};
use crate::config::TurnConfig;
use crate::domain::allocation::{AllocationTable, LifetimePolicy};
use crate::domain::channel::ChannelBindingRegistry;
use crate::domain::credential::CredentialStore;
use crate::domain::permission::PermissionRegistry;
use crate::domain::shared::{FiveTuple, RelayError, Result, TransportProtocol};
use futures::future::join_all;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct TurnServer {
    local_addr: SocketAddr,
    transport: TransportProtocol,
    handler: Arc<TurnHandler>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TurnServer {
    /// Bind the listener and start serving
    ///
    /// Failing to bind the listener is fatal: without it no allocation can
    /// ever be made.
    pub async fn start(config: &TurnConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let handler = Arc::new(build_handler(config, credentials));
        let listen_addr = config.listen_addr();
        let (shutdown, _) = watch::channel(false);

        info!(
            "Starting TURN server on {} ({}, realm {}, relay {} ports {}-{})",
            listen_addr,
            config.transport,
            config.realm,
            config.public_ip,
            config.relay_port_min,
            config.relay_port_max
        );

        let (local_addr, listener_task) = match config.transport {
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind(listen_addr)
                    .await
                    .map_err(|e| RelayError::Transport(format!("Failed to bind UDP {}: {}", listen_addr, e)))?;
                let local_addr = socket.local_addr()?;
                let task = tokio::spawn(serve_udp(
                    Arc::new(socket),
                    Arc::clone(&handler),
                    shutdown.subscribe(),
                ));
                (local_addr, task)
            }
            TransportProtocol::Tcp => {
                let listener = TcpListener::bind(listen_addr)
                    .await
                    .map_err(|e| RelayError::Transport(format!("Failed to bind TCP {}: {}", listen_addr, e)))?;
                let local_addr = listener.local_addr()?;
                let task = tokio::spawn(serve_tcp(listener, Arc::clone(&handler), shutdown.subscribe()));
                (local_addr, task)
            }
        };

        let tasks = vec![
            listener_task,
            spawn_allocation_sweeper(
                Arc::clone(&handler),
                config.allocation_sweep_interval(),
                shutdown.subscribe(),
            ),
            spawn_permission_sweeper(
                Arc::clone(&handler),
                config.permission_sweep_interval(),
                shutdown.subscribe(),
            ),
        ];

        info!("TURN server listening on {} ({})", local_addr, config.transport);
        Ok(Self {
            local_addr,
            transport: config.transport,
            handler,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    pub fn handler(&self) -> &Arc<TurnHandler> {
        &self.handler
    }

    pub fn allocation_count(&self) -> usize {
        self.handler.table().len()
    }

    /// Stop listening and release every allocation
    pub async fn shutdown(&mut self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down TURN server on {}", self.local_addr);

        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                warn!("Server task ended abnormally: {}", e);
            }
        }
        let released = self.handler.table().clear();
        info!("TURN server stopped, {} allocations released", released);
    }
}

fn build_handler(config: &TurnConfig, credentials: Arc<dyn CredentialStore>) -> TurnHandler {
    let table = Arc::new(AllocationTable::new(
        Arc::new(PermissionRegistry::new(config.permission_lifetime())),
        Arc::new(ChannelBindingRegistry::new(config.channel_lifetime())),
        LifetimePolicy {
            default_lifetime: config.default_lifetime(),
            max_lifetime: config.max_lifetime(),
        },
        config.max_allocations,
    ));
    let relay = RelayPath::new(
        table,
        Arc::new(PendingConnections::new(config.connect_timeout())),
        config.connect_timeout(),
    );
    let allocator = Arc::new(PortRangeAllocator::new(
        config.relay_address,
        config.public_ip,
        config.relay_port_min,
        config.relay_port_max,
    ));
    let auth = Authenticator::new(config.realm.clone(), credentials, config.nonce_lifetime());

    TurnHandler::new(allocator, relay, auth, config.software.clone())
}

/// Single dispatcher for every datagram on the listening socket
async fn serve_udp(socket: Arc<UdpSocket>, handler: Arc<TurnHandler>, mut shutdown: watch::Receiver<bool>) {
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("UDP listener has no local address: {}", e);
            return;
        }
    };
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (size, client) = tokio::select! {
            _ = raised(&mut shutdown) => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive error on {}: {}", local_addr, e);
                    continue;
                }
            },
        };

        let ctx = RequestContext::new(
            FiveTuple::new(client, local_addr, TransportProtocol::Udp),
            ClientSink::Udp {
                socket: Arc::clone(&socket),
                client,
            },
        );
        let output = handler.handle_message(&buf[..size], &ctx).await;
        if let Some(reply) = output.reply {
            if let Err(e) = socket.send_to(&reply, client).await {
                debug!("Failed to answer {}: {}", client, e);
            }
        }
    }

    debug!("UDP listener {} stopped", local_addr);
}

async fn serve_tcp(listener: TcpListener, handler: Arc<TurnHandler>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = raised(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, client)) => {
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, client, handler, shutdown).await {
                            debug!("TCP connection from {} ended: {}", client, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!("TCP listener stopped");
}

/// One client TCP connection: a control connection, or a data connection
/// when its first message is a successful ConnectionBind
async fn serve_connection(
    mut stream: TcpStream,
    client: SocketAddr,
    handler: Arc<TurnHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let five_tuple = FiveTuple::new(client, stream.local_addr()?, TransportProtocol::Tcp);
    debug!("TCP connection from {}", client);

    let first = tokio::select! {
        _ = raised(&mut shutdown) => return Ok(()),
        frame = read_frame(&mut stream) => match frame? {
            Some(frame) => frame,
            None => return Ok(()),
        },
    };

    let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
    let sink = ClientSink::Stream(tx);
    let ctx = RequestContext::new(five_tuple, sink.clone()).first_on_stream();
    let output = handler.handle_message(&first, &ctx).await;

    if let Some(connection) = output.upgrade {
        if let Some(reply) = output.reply {
            stream.write_all(&reply).await?;
        }
        return splice(stream, connection).await;
    }

    let (mut reader, writer) = stream.into_split();
    tokio::spawn(write_queue(writer, rx));
    let ctx = RequestContext::new(five_tuple, sink.clone());
    let mut pending_reply = output.reply;

    let result = loop {
        if let Some(reply) = pending_reply.take() {
            if sink.send(reply).await.is_err() {
                break Ok(());
            }
        }
        let frame = tokio::select! {
            _ = raised(&mut shutdown) => break Ok(()),
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(frame)) => pending_reply = handler.handle_message(&frame, &ctx).await.reply,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    handler.close_five_tuple(&five_tuple);
    debug!("TCP control connection {} closed", five_tuple);
    result
}

fn spawn_allocation_sweeper(
    handler: Arc<TurnHandler>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = raised(&mut shutdown) => break,
                _ = ticker.tick() => {
                    let expired = handler.table().sweep();
                    if !expired.is_empty() {
                        info!("Swept {} expired allocations", expired.len());
                    }
                }
            }
        }
    })
}

fn spawn_permission_sweeper(
    handler: Arc<TurnHandler>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = raised(&mut shutdown) => break,
                _ = ticker.tick() => {
                    let table = handler.table();
                    let permissions = table.permissions().sweep();
                    let channels = table.channels().sweep();
                    let connections = handler.relay().pending().sweep();
                    let nonces = handler.authenticator().nonces().sweep();
                    if permissions + channels + connections > 0 {
                        debug!(
                            "Swept {} permissions, {} channel bindings, {} pending connections, {} nonces",
                            permissions, channels, connections, nonces
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credential::StaticCredentialStore;
    use crate::infrastructure::protocols::stun::{Method, StunMessage};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(transport: TransportProtocol) -> TurnConfig {
        TurnConfig {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            transport,
            relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            relay_port_min: 0,
            relay_port_max: 0,
            ..TurnConfig::default()
        }
    }

    #[tokio::test]
    async fn test_udp_binding_and_shutdown() {
        let credentials = Arc::new(StaticCredentialStore::new("turnkey.local"));
        let mut server = TurnServer::start(&test_config(TransportProtocol::Udp), credentials)
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = StunMessage::new_request(Method::Binding);
        client
            .send_to(&request.encode(None).unwrap(), server.local_addr())
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let (size, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = StunMessage::from_bytes(&buf[..size]).unwrap();
        assert_eq!(reply.transaction_id, request.transaction_id);
        assert_eq!(reply.get_xor_mapped_address(), Some(client.local_addr().unwrap()));

        server.shutdown().await;
        assert_eq!(server.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = TurnConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config(TransportProtocol::Tcp)
        };
        let credentials = Arc::new(StaticCredentialStore::new("turnkey.local"));

        let result = TurnServer::start(&config, credentials).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }
}
