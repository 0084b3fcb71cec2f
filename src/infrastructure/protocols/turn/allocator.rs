//! Relay transport allocation
//!
//! Binds the UDP socket or TCP listener that backs an allocation and works
//! out the relayed address peers will see.

use crate::domain::shared::{RelayError, Result, TransportProtocol};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tracing::{debug, warn};

/// Port draws before the range is reported exhausted
const MAX_BIND_ATTEMPTS: usize = 64;

/// Transport handle kept by an allocation
#[derive(Debug, Clone)]
pub enum RelayTransport {
    Udp(Arc<UdpSocket>),
    /// The listener itself is owned by the accept task
    Tcp { local_addr: SocketAddr },
}

impl RelayTransport {
    pub fn protocol(&self) -> TransportProtocol {
        match self {
            RelayTransport::Udp(_) => TransportProtocol::Udp,
            RelayTransport::Tcp { .. } => TransportProtocol::Tcp,
        }
    }
}

/// Relay ports held by live allocations
type PortSet = DashMap<(TransportProtocol, u16), ()>;

/// Claim on a relay port, given back when dropped
///
/// Reuse-port listeners let the kernel hand one port to two allocations, so
/// the allocator keeps its own book of ports in use.
#[derive(Debug)]
pub struct PortLease {
    ports: Arc<PortSet>,
    key: (TransportProtocol, u16),
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.key.1
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.ports.remove(&self.key);
        debug!("Relay port {}/{} returned", self.key.1, self.key.0);
    }
}

/// Freshly bound relay transport
///
/// The lease must live as long as the socket or listener does.
#[derive(Debug)]
pub enum AcquiredTransport {
    Udp {
        socket: UdpSocket,
        relayed_addr: SocketAddr,
        lease: PortLease,
    },
    Tcp {
        listener: TcpListener,
        relayed_addr: SocketAddr,
        lease: PortLease,
    },
}

impl AcquiredTransport {
    pub fn relayed_addr(&self) -> SocketAddr {
        match self {
            AcquiredTransport::Udp { relayed_addr, .. } | AcquiredTransport::Tcp { relayed_addr, .. } => {
                *relayed_addr
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransportAllocator: Send + Sync {
    /// Bind a relay transport; failures are final for the Allocate request
    async fn acquire(&self, protocol: TransportProtocol) -> Result<AcquiredTransport>;
}

/// Allocates relay ports at random from a configured range
#[derive(Debug, Clone)]
pub struct PortRangeAllocator {
    bind_ip: IpAddr,
    public_ip: IpAddr,
    port_min: u16,
    port_max: u16,
    in_use: Arc<PortSet>,
}

impl PortRangeAllocator {
    /// A `0..=0` range lets the OS pick ephemeral ports
    pub fn new(bind_ip: IpAddr, public_ip: IpAddr, port_min: u16, port_max: u16) -> Self {
        Self {
            bind_ip,
            public_ip,
            port_min,
            port_max,
            in_use: Arc::new(DashMap::new()),
        }
    }

    /// Ports currently leased out
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    fn candidate_ports(&self) -> Vec<u16> {
        if self.port_min == 0 && self.port_max == 0 {
            return vec![0; MAX_BIND_ATTEMPTS];
        }
        let span = usize::from(self.port_max - self.port_min) + 1;
        let mut rng = rand::thread_rng();
        (0..span.min(MAX_BIND_ATTEMPTS))
            .map(|_| rng.gen_range(self.port_min..=self.port_max))
            .collect()
    }

    /// `None` when another allocation holds the port
    fn lease(&self, protocol: TransportProtocol, port: u16) -> Option<PortLease> {
        match self.in_use.entry((protocol, port)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(PortLease {
                    ports: Arc::clone(&self.in_use),
                    key: (protocol, port),
                })
            }
        }
    }

    fn relayed(&self, local: SocketAddr) -> SocketAddr {
        SocketAddr::new(self.public_ip, local.port())
    }
}

/// Listener with address reuse so a relayed Connect can dial from the same port
pub fn bind_reusable_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = reusable_socket(addr)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

pub fn reusable_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    Ok(socket)
}

enum Bound {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

impl Bound {
    async fn bind(protocol: TransportProtocol, addr: SocketAddr) -> io::Result<(Bound, SocketAddr)> {
        match protocol {
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind(addr).await?;
                let local = socket.local_addr()?;
                Ok((Bound::Udp(socket), local))
            }
            TransportProtocol::Tcp => {
                let listener = bind_reusable_listener(addr)?;
                let local = listener.local_addr()?;
                Ok((Bound::Tcp(listener), local))
            }
        }
    }
}

#[async_trait]
impl RelayTransportAllocator for PortRangeAllocator {
    async fn acquire(&self, protocol: TransportProtocol) -> Result<AcquiredTransport> {
        for port in self.candidate_ports() {
            // Fixed ports are claimed before binding, ephemeral ones after
            let claimed = match port {
                0 => None,
                port => match self.lease(protocol, port) {
                    Some(lease) => Some(lease),
                    None => continue,
                },
            };

            let addr = SocketAddr::new(self.bind_ip, port);
            let (bound, local) = match Bound::bind(protocol, addr).await {
                Ok(bound) => bound,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => {
                    warn!("Failed to bind relay transport on {}: {}", addr, e);
                    return Err(RelayError::ResourceExhausted(format!(
                        "cannot bind relay transport: {}",
                        e
                    )));
                }
            };

            let lease = match claimed.or_else(|| self.lease(protocol, local.port())) {
                Some(lease) => lease,
                None => {
                    debug!("Ephemeral {} port {} already leased, retrying", protocol, local.port());
                    continue;
                }
            };
            let relayed_addr = self.relayed(local);
            debug!("Bound {} relay transport {}", protocol, relayed_addr);
            return Ok(match bound {
                Bound::Udp(socket) => AcquiredTransport::Udp {
                    socket,
                    relayed_addr,
                    lease,
                },
                Bound::Tcp(listener) => AcquiredTransport::Tcp {
                    listener,
                    relayed_addr,
                    lease,
                },
            });
        }

        Err(RelayError::ResourceExhausted(format!(
            "no free relay port in {}-{}",
            self.port_min, self.port_max
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn test_acquire_udp_ephemeral() {
        let allocator = PortRangeAllocator::new(loopback(), "203.0.113.1".parse().unwrap(), 0, 0);
        let acquired = allocator.acquire(TransportProtocol::Udp).await.unwrap();

        let relayed = acquired.relayed_addr();
        assert_eq!(relayed.ip(), "203.0.113.1".parse::<IpAddr>().unwrap());
        match acquired {
            AcquiredTransport::Udp { socket, .. } => {
                assert_eq!(socket.local_addr().unwrap().port(), relayed.port());
            }
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquire_tcp_listener() {
        let allocator = PortRangeAllocator::new(loopback(), loopback(), 0, 0);
        let acquired = allocator.acquire(TransportProtocol::Tcp).await.unwrap();
        assert!(matches!(acquired, AcquiredTransport::Tcp { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let taken = UdpSocket::bind((loopback(), 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let allocator = PortRangeAllocator::new(loopback(), loopback(), port, port);

        let err = allocator.acquire(TransportProtocol::Udp).await.unwrap_err();
        assert!(matches!(err, RelayError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_acquire_within_range() {
        let scratch = UdpSocket::bind((loopback(), 0)).await.unwrap();
        let port = scratch.local_addr().unwrap().port();
        drop(scratch);

        let allocator = PortRangeAllocator::new(loopback(), loopback(), port, port);
        let acquired = allocator.acquire(TransportProtocol::Udp).await.unwrap();
        assert_eq!(acquired.relayed_addr().port(), port);
    }

    fn free_tcp_port() -> u16 {
        let listener = std::net::TcpListener::bind((loopback(), 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_tcp_port_not_handed_out_twice() {
        let port = free_tcp_port();
        let allocator = PortRangeAllocator::new(loopback(), loopback(), port, port);

        let first = allocator.acquire(TransportProtocol::Tcp).await.unwrap();
        assert_eq!(first.relayed_addr().port(), port);
        assert_eq!(allocator.in_use(), 1);

        // The kernel would share a reuse-port listener; the lease book must not
        let err = allocator.acquire(TransportProtocol::Tcp).await.unwrap_err();
        assert!(matches!(err, RelayError::ResourceExhausted(_)));

        drop(first);
        assert_eq!(allocator.in_use(), 0);
        let again = allocator.acquire(TransportProtocol::Tcp).await.unwrap();
        assert_eq!(again.relayed_addr().port(), port);
    }

    #[tokio::test]
    async fn test_ephemeral_ports_are_leased() {
        let allocator = PortRangeAllocator::new(loopback(), loopback(), 0, 0);
        let first = allocator.acquire(TransportProtocol::Tcp).await.unwrap();
        let second = allocator.acquire(TransportProtocol::Tcp).await.unwrap();

        assert_ne!(first.relayed_addr(), second.relayed_addr());
        assert_eq!(allocator.in_use(), 2);

        // An ephemeral port already on the books is never returned
        let taken = first.relayed_addr().port();
        let lease = allocator.lease(TransportProtocol::Tcp, taken);
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn test_same_port_number_per_transport() {
        let port = free_tcp_port();
        let allocator = PortRangeAllocator::new(loopback(), loopback(), port, port);

        let lease = allocator.lease(TransportProtocol::Tcp, port).unwrap();
        assert_eq!(lease.port(), port);
        assert!(allocator.lease(TransportProtocol::Udp, port).is_some());
        assert!(allocator.lease(TransportProtocol::Tcp, port).is_none());
    }
}
