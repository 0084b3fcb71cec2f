//! TCP allocation integration tests: Connect, ConnectionAttempt and
//! ConnectionBind against a real server on loopback

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use turnkey::config::TurnConfig;
use turnkey::domain::credential::StaticCredentialStore;
use turnkey::domain::shared::TransportProtocol;
use turnkey::infrastructure::protocols::turn::{ClientConfig, TcpAllocation, TurnClient, TurnServer};
use turnkey::RelayError;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> TurnServer {
    let config = TurnConfig {
        listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        transport: TransportProtocol::Tcp,
        relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        relay_port_min: 0,
        relay_port_max: 0,
        ..TurnConfig::default()
    };
    let credentials = StaticCredentialStore::from_users(config.realm.clone(), "alice=secret bob=hunter2").unwrap();
    TurnServer::start(&config, Arc::new(credentials)).await.unwrap()
}

async fn allocate(server: &TurnServer, user: &str, password: &str) -> TcpAllocation {
    let mut config = ClientConfig::new(server.local_addr(), user, password, "turnkey.local");
    config.transport = TransportProtocol::Tcp;
    let client = TurnClient::connect(config).await.unwrap();
    client.allocate_tcp().await.unwrap()
}

#[tokio::test]
async fn test_udp_control_connection_cannot_allocate_tcp() {
    let mut server = start_server().await;
    let client = TurnClient::connect(ClientConfig::new(server.local_addr(), "alice", "secret", "turnkey.local"))
        .await
        .unwrap();

    assert!(matches!(client.allocate_tcp().await, Err(RelayError::BadRequest(_))));
    server.shutdown().await;
}

#[tokio::test]
async fn test_dial_needs_permission() {
    let mut server = start_server().await;
    let allocation = allocate(&server, "alice", "secret").await;
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let err = allocation.dial_peer(peer.local_addr().unwrap()).await.unwrap_err();
    assert!(matches!(err, RelayError::Forbidden(_)));

    allocation.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_dial_peer_relays_both_ways() {
    let mut server = start_server().await;
    let allocation = allocate(&server, "alice", "secret").await;
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    allocation.create_permission(peer_addr).await.unwrap();
    let (stream, accepted) = tokio::join!(allocation.dial_peer(peer_addr), peer.accept());
    let mut stream = stream.unwrap();
    let (mut peer_stream, _) = accepted.unwrap();

    stream.write_all(b"hello!").await.unwrap();
    let mut buf = [0u8; 6];
    tokio::time::timeout(WAIT, peer_stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello!");

    peer_stream.write_all(b"hello back!").await.unwrap();
    let mut buf = [0u8; 11];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello back!");

    drop(stream);
    let mut rest = Vec::new();
    let read = tokio::time::timeout(WAIT, peer_stream.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(read, 0);

    allocation.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_accept_peer_after_permission() {
    let mut server = start_server().await;
    let allocation = allocate(&server, "alice", "secret").await;
    let relayed = allocation.local_addr();

    allocation
        .create_permission("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut peer = TcpStream::connect(relayed).await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    let (mut stream, from) = tokio::time::timeout(WAIT, allocation.accept_peer()).await.unwrap().unwrap();
    assert_eq!(from, peer_addr);

    peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");

    stream.write_all(b"pong").await.unwrap();
    tokio::time::timeout(WAIT, peer.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"pong");

    allocation.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_two_clients_meet_through_their_relays() {
    let mut server = start_server().await;
    let alice = allocate(&server, "alice", "secret").await;
    let bob = allocate(&server, "bob", "hunter2").await;

    alice.create_permission(bob.local_addr()).await.unwrap();
    bob.create_permission(alice.local_addr()).await.unwrap();

    let (dialed, accepted) = tokio::join!(alice.dial_peer(bob.local_addr()), bob.accept_peer());
    let mut dialed = dialed.unwrap();
    let (mut accepted, _) = accepted.unwrap();

    dialed.write_all(b"hello!").await.unwrap();
    let mut buf = [0u8; 6];
    tokio::time::timeout(WAIT, accepted.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello!");

    alice.close().await;
    bob.close().await;
    server.shutdown().await;
}
