//! Allocation table
//!
//! Authoritative registry of live allocations. Lookups by id, by client
//! five-tuple and by relayed address are all lock-sharded, so the relay data
//! path never waits on control-plane mutations of unrelated allocations.

use super::entity::Allocation;
use crate::domain::channel::ChannelBindingRegistry;
use crate::domain::permission::PermissionRegistry;
use crate::domain::shared::{AllocationId, FiveTuple, RelayError, Result, TransportProtocol};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifetime limits applied to Allocate and Refresh requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimePolicy {
    pub default_lifetime: Duration,
    pub max_lifetime: Duration,
}

impl LifetimePolicy {
    /// Requested lifetime clamped to the maximum; absent means default
    pub fn effective(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.default_lifetime.min(self.max_lifetime),
            Some(requested) => requested.min(self.max_lifetime),
        }
    }
}

/// Outcome of a Refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refreshed {
    Extended { lifetime: Duration, deadline: Instant },
    Deleted,
}

pub struct AllocationTable<T> {
    allocations: DashMap<AllocationId, Arc<Allocation<T>>>,
    by_five_tuple: DashMap<FiveTuple, AllocationId>,
    by_relayed_addr: DashMap<SocketAddr, AllocationId>,
    permissions: Arc<PermissionRegistry>,
    channels: Arc<ChannelBindingRegistry>,
    policy: LifetimePolicy,
    max_allocations: usize,
}

impl<T> AllocationTable<T> {
    pub fn new(
        permissions: Arc<PermissionRegistry>,
        channels: Arc<ChannelBindingRegistry>,
        policy: LifetimePolicy,
        max_allocations: usize,
    ) -> Self {
        Self {
            allocations: DashMap::new(),
            by_five_tuple: DashMap::new(),
            by_relayed_addr: DashMap::new(),
            permissions,
            channels,
            policy,
            max_allocations,
        }
    }

    pub fn permissions(&self) -> &Arc<PermissionRegistry> {
        &self.permissions
    }

    pub fn channels(&self) -> &Arc<ChannelBindingRegistry> {
        &self.channels
    }

    pub fn policy(&self) -> LifetimePolicy {
        self.policy
    }

    /// Register a new allocation
    ///
    /// Fails with `DuplicateAllocation` when the five-tuple already owns a
    /// live allocation; the caller decides whether that is an idempotent
    /// retransmission or a mismatch. A zero effective lifetime creates nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        username: &str,
        five_tuple: FiveTuple,
        protocol: TransportProtocol,
        requested_lifetime: Option<Duration>,
        relayed_addr: SocketAddr,
        transport: T,
    ) -> Result<Arc<Allocation<T>>> {
        self.create_at(
            username,
            five_tuple,
            protocol,
            requested_lifetime,
            relayed_addr,
            transport,
            Instant::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_at(
        &self,
        username: &str,
        five_tuple: FiveTuple,
        protocol: TransportProtocol,
        requested_lifetime: Option<Duration>,
        relayed_addr: SocketAddr,
        transport: T,
        now: Instant,
    ) -> Result<Arc<Allocation<T>>> {
        if let Some(existing) = self.get_by_five_tuple_at(&five_tuple, now) {
            return Err(RelayError::DuplicateAllocation(existing.id()));
        }

        let lifetime = self.policy.effective(requested_lifetime);
        if lifetime.is_zero() {
            return Err(RelayError::BadRequest(
                "zero lifetime allocate creates nothing".to_string(),
            ));
        }
        if self.allocations.len() >= self.max_allocations {
            return Err(RelayError::ResourceExhausted(format!(
                "allocation limit {} reached",
                self.max_allocations
            )));
        }

        match self.by_five_tuple.entry(five_tuple) {
            Entry::Occupied(entry) => Err(RelayError::DuplicateAllocation(*entry.get())),
            Entry::Vacant(entry) => {
                let relayed_slot = match self.by_relayed_addr.entry(relayed_addr) {
                    Entry::Occupied(owner) => {
                        return Err(RelayError::Conflict(format!(
                            "relayed address {} already belongs to allocation {}",
                            relayed_addr,
                            owner.get()
                        )));
                    }
                    Entry::Vacant(slot) => slot,
                };
                let allocation = Arc::new(Allocation::new(
                    username,
                    five_tuple,
                    protocol,
                    relayed_addr,
                    lifetime,
                    transport,
                    now,
                ));
                let id = allocation.id();
                self.allocations.insert(id, Arc::clone(&allocation));
                relayed_slot.insert(id);
                entry.insert(id);

                info!(
                    "Allocation {} created for {} on {} -> {} ({} relay, lifetime {}s)",
                    id,
                    username,
                    five_tuple,
                    relayed_addr,
                    protocol,
                    lifetime.as_secs()
                );
                Ok(allocation)
            }
        }
    }

    pub fn refresh(&self, id: AllocationId, requested_lifetime: Option<Duration>) -> Result<Refreshed> {
        self.refresh_at(id, requested_lifetime, Instant::now())
    }

    /// Extend an allocation, or tear it down when the requested lifetime is zero
    pub fn refresh_at(
        &self,
        id: AllocationId,
        requested_lifetime: Option<Duration>,
        now: Instant,
    ) -> Result<Refreshed> {
        let allocation = self
            .get_at(id, now)
            .ok_or_else(|| RelayError::NotFound(format!("allocation {}", id)))?;

        let lifetime = self.policy.effective(requested_lifetime);
        if lifetime.is_zero() {
            self.remove(id);
            return Ok(Refreshed::Deleted);
        }

        let deadline = allocation.extend_at(now, lifetime);
        if allocation.is_released() {
            // Lost a race against a concurrent teardown
            return Err(RelayError::NotFound(format!("allocation {}", id)));
        }
        debug!("Allocation {} refreshed for {}s", id, lifetime.as_secs());

        Ok(Refreshed::Extended { lifetime, deadline })
    }

    /// Tear an allocation down with its permissions and channel bindings
    ///
    /// Idempotent: only the first caller gets the allocation back.
    pub fn remove(&self, id: AllocationId) -> Option<Arc<Allocation<T>>> {
        let (_, allocation) = self.allocations.remove(&id)?;

        self.by_five_tuple
            .remove_if(&allocation.five_tuple(), |_, owner| *owner == id);
        self.by_relayed_addr
            .remove_if(&allocation.relayed_addr(), |_, owner| *owner == id);
        let permissions = self.permissions.remove_allocation(id);
        let channels = self.channels.remove_allocation(id);
        allocation.release();

        info!(
            "Allocation {} released ({} permissions, {} channels dropped)",
            id, permissions, channels
        );
        Some(allocation)
    }

    pub fn get(&self, id: AllocationId) -> Option<Arc<Allocation<T>>> {
        self.get_at(id, Instant::now())
    }

    /// Live allocation by id; an expired one is reclaimed on the spot
    pub fn get_at(&self, id: AllocationId, now: Instant) -> Option<Arc<Allocation<T>>> {
        let allocation = self.allocations.get(&id).map(|entry| Arc::clone(entry.value()))?;
        self.live_or_reclaim(allocation, now)
    }

    pub fn get_by_five_tuple(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation<T>>> {
        self.get_by_five_tuple_at(five_tuple, Instant::now())
    }

    pub fn get_by_five_tuple_at(
        &self,
        five_tuple: &FiveTuple,
        now: Instant,
    ) -> Option<Arc<Allocation<T>>> {
        let id = *self.by_five_tuple.get(five_tuple)?;
        self.get_at(id, now)
    }

    pub fn get_by_relayed_addr(&self, relayed_addr: &SocketAddr) -> Option<Arc<Allocation<T>>> {
        let id = *self.by_relayed_addr.get(relayed_addr)?;
        self.get(id)
    }

    fn live_or_reclaim(&self, allocation: Arc<Allocation<T>>, now: Instant) -> Option<Arc<Allocation<T>>> {
        if allocation.is_expired_at(now) {
            debug!("Allocation {} expired, reclaiming on lookup", allocation.id());
            self.remove(allocation.id());
            None
        } else {
            Some(allocation)
        }
    }

    pub fn sweep(&self) -> Vec<Arc<Allocation<T>>> {
        self.sweep_at(Instant::now())
    }

    /// Remove every allocation past its deadline; returns the ones removed here
    pub fn sweep_at(&self, now: Instant) -> Vec<Arc<Allocation<T>>> {
        let expired: Vec<AllocationId> = self
            .allocations
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| *entry.key())
            .collect();

        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Release everything, used at shutdown
    pub fn clear(&self) -> usize {
        let ids: Vec<AllocationId> = self.allocations.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).count()
    }

    pub fn all(&self) -> Vec<Arc<Allocation<T>>> {
        self.allocations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
