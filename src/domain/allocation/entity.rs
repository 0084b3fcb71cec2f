//! Allocation entity

use crate::domain::shared::{AllocationId, FiveTuple, TransportProtocol};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// One client's reserved relay transport
///
/// `T` is the relay transport handle (a socket or listener in the server, a
/// unit value in tests). The deadline is stored as an offset from
/// `created_at` so it can be moved without a lock.
pub struct Allocation<T> {
    id: AllocationId,
    username: String,
    five_tuple: FiveTuple,
    protocol: TransportProtocol,
    relayed_addr: SocketAddr,
    created_at: Instant,
    deadline_nanos: AtomicU64,
    closed: watch::Sender<bool>,
    transport: T,
}

impl<T> Allocation<T> {
    pub fn new(
        username: impl Into<String>,
        five_tuple: FiveTuple,
        protocol: TransportProtocol,
        relayed_addr: SocketAddr,
        lifetime: Duration,
        transport: T,
        now: Instant,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: AllocationId::new(),
            username: username.into(),
            five_tuple,
            protocol,
            relayed_addr,
            created_at: now,
            deadline_nanos: AtomicU64::new(duration_nanos(lifetime)),
            closed,
            transport,
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn five_tuple(&self) -> FiveTuple {
        self.five_tuple
    }

    /// Protocol of the relayed transport (not of the control connection)
    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn deadline(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.deadline_nanos.load(Ordering::Acquire))
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Move the deadline to `now + lifetime`
    pub fn extend_at(&self, now: Instant, lifetime: Duration) -> Instant {
        let offset = now.saturating_duration_since(self.created_at) + lifetime;
        self.deadline_nanos
            .store(duration_nanos(offset), Ordering::Release);
        self.created_at + offset
    }

    /// Signal teardown to every task serving this allocation
    ///
    /// Returns true only for the call that performed the release.
    pub fn release(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_released(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that flips to `true` once the allocation is released
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl<T> std::fmt::Debug for Allocation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("five_tuple", &self.five_tuple)
            .field("protocol", &self.protocol)
            .field("relayed_addr", &self.relayed_addr)
            .field("deadline", &self.deadline())
            .finish()
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
