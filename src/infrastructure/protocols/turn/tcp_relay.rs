//! Peer TCP connections waiting for a ConnectionBind (RFC 6062)

use crate::domain::shared::{AllocationId, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// A peer connection held until the client binds a data connection to it
#[derive(Debug)]
pub struct PendingConnection {
    pub allocation: AllocationId,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    pub created_at: Instant,
}

/// Pending peer connections keyed by CONNECTION-ID
pub struct PendingConnections {
    next_id: AtomicU32,
    pending: DashMap<ConnectionId, PendingConnection>,
    timeout: Duration,
}

impl PendingConnections {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU32::new(rand::thread_rng().gen()),
            pending: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn insert(&self, allocation: AllocationId, peer: SocketAddr, stream: TcpStream) -> ConnectionId {
        self.insert_at(allocation, peer, stream, Instant::now())
    }

    pub fn insert_at(
        &self,
        allocation: AllocationId,
        peer: SocketAddr,
        stream: TcpStream,
        now: Instant,
    ) -> ConnectionId {
        let connection = PendingConnection {
            allocation,
            peer,
            stream,
            created_at: now,
        };
        loop {
            let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            match self.pending.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    debug!("Pending connection {} from {} for {}", id, connection.peer, allocation);
                    slot.insert(connection);
                    return id;
                }
            }
        }
    }

    /// Claim a pending connection; each id can be taken once
    pub fn take(&self, id: ConnectionId) -> Option<PendingConnection> {
        self.pending.remove(&id).map(|(_, connection)| connection)
    }

    pub fn has_peer(&self, allocation: AllocationId, peer: SocketAddr) -> bool {
        self.pending
            .iter()
            .any(|entry| entry.allocation == allocation && entry.peer == peer)
    }

    pub fn remove_allocation(&self, allocation: AllocationId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, connection| connection.allocation != allocation);
        before - self.pending.len()
    }

    /// Close connections nobody bound in time
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, connection| now.duration_since(connection.created_at) < self.timeout);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
