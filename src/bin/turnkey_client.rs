//! Command-line TURN client: allocate a relay, optionally ping through it or
//! exchange a message with another client over TCP allocations.

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use clap::Parser;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use turnkey::domain::shared::TransportProtocol;
use turnkey::infrastructure::protocols::turn::{ClientConfig, RelaySocket, TcpAllocation, TurnClient};

/// Where the two `--tcp` clients swap relayed addresses
const SIGNALING_ADDR: &str = "127.0.0.1:5000";

const PING_COUNT: usize = 10;

#[derive(Parser)]
#[command(name = "turnkey-client")]
#[command(about = "Allocate a relay on a TURN server and exercise it")]
struct Args {
    /// TURN server host name or address
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 3478)]
    port: u16,

    /// Credentials as `user=pass`
    #[arg(long)]
    user: String,

    #[arg(long, default_value = "turnkey.local")]
    realm: String,

    /// Use a TCP control connection and a TCP allocation
    #[arg(long)]
    tcp: bool,

    /// Ping through the relay (UDP only)
    #[arg(long)]
    ping: bool,

    /// Host the signaling listener and dial the peer (TCP only)
    #[arg(long)]
    signaling: bool,

    /// Bind channels instead of sending Send indications
    #[arg(long)]
    channels: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let (username, password) = args
        .user
        .split_once('=')
        .ok_or_else(|| anyhow!("--user must look like user=pass"))?;

    let server = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("resolving {}", args.host))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("{} has no IPv4 address", args.host))?;

    let mut config = ClientConfig::new(server, username, password, args.realm.clone());
    config.channel_mode = args.channels;
    if args.tcp {
        config.transport = TransportProtocol::Tcp;
    }

    let client = TurnClient::connect(config).await.context("connecting to TURN server")?;

    if args.tcp {
        let allocation = client.allocate_tcp().await.context("allocating TCP relay")?;
        info!("relayed-address={}", allocation.local_addr());
        let result = exchange_with_peer(&allocation, args.signaling).await;
        allocation.close().await;
        result
    } else {
        let relay = client.allocate().await.context("allocating relay")?;
        info!("relayed-address={}", relay.local_addr());
        let result = if args.ping {
            ping_test(&client, &relay).await
        } else {
            Ok(())
        };
        relay.close().await;
        result
    }
}

/// Echo everything arriving on the relay and time pings sent to it from a
/// plain UDP socket
async fn ping_test(client: &TurnClient, relay: &RelaySocket) -> anyhow::Result<()> {
    let mapped = client.send_binding_request().await.context("binding request")?;
    info!("mapped-address={}", mapped);

    let pinger = UdpSocket::bind("0.0.0.0:0").await?;
    let pinger_addr = SocketAddr::new(mapped.ip(), pinger.local_addr()?.port());

    // Opens the permission for our own public IP.
    relay.send_to(Bytes::from_static(b"Hello"), mapped).await?;

    let pings = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut buf = vec![0u8; 1600];
        for _ in 0..PING_COUNT {
            let sent_at = now_nanos();
            pinger.send_to(sent_at.to_string().as_bytes(), relay.local_addr()).await?;

            match tokio::time::timeout(Duration::from_secs(1), pinger.recv_from(&mut buf)).await {
                Ok(Ok((size, from))) => {
                    let rtt = std::str::from_utf8(&buf[..size])
                        .ok()
                        .and_then(|text| text.parse::<u128>().ok())
                        .map(|sent| now_nanos().saturating_sub(sent) / 1_000_000);
                    match rtt {
                        Some(rtt) => info!("{} bytes from {} time={} ms", size, from, rtt),
                        None => info!("{} bytes from {}", size, from),
                    }
                }
                Ok(Err(e)) => return Err(anyhow::Error::from(e)),
                Err(_) => warn!("ping to {} from {} timed out", relay.local_addr(), pinger_addr),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = echo(relay) => result.context("echo loop failed"),
        result = pings => result,
    }
}

async fn echo(relay: &RelaySocket) -> turnkey::Result<()> {
    loop {
        let (data, from) = relay.recv_from().await?;
        relay.send_to(data, from).await?;
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}

/// Swap relayed addresses over the signaling socket, then say hello through
/// the relays: the signaling side dials, the other side accepts
async fn exchange_with_peer(allocation: &TcpAllocation, signaling: bool) -> anyhow::Result<()> {
    let peer = swap_addresses(signaling, allocation.local_addr()).await?;
    info!("Received peer address: {}", peer);

    allocation.create_permission(peer).await.context("creating permission")?;

    let mut buf = vec![0u8; 4096];
    let read = if signaling {
        let mut stream = allocation.dial_peer(peer).await.context("dialing peer")?;
        stream.write_all(b"hello!").await?;
        let read = stream.read(&mut buf).await?;
        stream.shutdown().await?;
        read
    } else {
        let (mut stream, from) = allocation.accept_peer().await.context("accepting peer")?;
        info!("Accepted connection from: {}", from);
        let read = stream.read(&mut buf).await?;
        stream.write_all(b"hello back!").await?;
        stream.shutdown().await?;
        read
    };

    info!("Read message: {}", String::from_utf8_lossy(&buf[..read]));
    Ok(())
}

async fn swap_addresses(signaling: bool, relayed: SocketAddr) -> anyhow::Result<SocketAddr> {
    let stream = if signaling {
        let listener = TcpListener::bind(SIGNALING_ADDR)
            .await
            .context("starting signaling listener")?;
        let (stream, _) = listener.accept().await?;
        stream
    } else {
        TcpStream::connect(SIGNALING_ADDR).await.context("dialing signaling listener")?
    };

    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{}\n", relayed).as_bytes()).await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    let line = line.trim();
    if line.is_empty() {
        bail!("signaling peer hung up without an address");
    }
    line.parse().with_context(|| format!("bad peer address {:?}", line))
}
