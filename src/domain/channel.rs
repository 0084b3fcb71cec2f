//! Channel binding registry
//!
//! Per-allocation two-way mapping between channel numbers and peer
//! transport addresses. Both directions are kept under the same entry lock
//! so a bind is atomic with respect to sweeps and concurrent binds.

use super::shared::{AllocationId, ChannelNumber, RelayError, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// A live channel binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: ChannelNumber,
    pub peer: SocketAddr,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct ChannelTable {
    by_channel: HashMap<ChannelNumber, ChannelBinding>,
    by_peer: HashMap<SocketAddr, ChannelNumber>,
}

impl ChannelTable {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<ChannelBinding> = self
            .by_channel
            .values()
            .filter(|binding| binding.expires_at <= now)
            .copied()
            .collect();
        for binding in &expired {
            self.by_channel.remove(&binding.channel);
            self.by_peer.remove(&binding.peer);
        }
        expired.len()
    }

    fn live(&self, channel: ChannelNumber, now: Instant) -> Option<&ChannelBinding> {
        self.by_channel
            .get(&channel)
            .filter(|binding| binding.expires_at > now)
    }
}

pub struct ChannelBindingRegistry {
    tables: DashMap<AllocationId, ChannelTable>,
    lifetime: Duration,
}

impl ChannelBindingRegistry {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            tables: DashMap::new(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn bind(
        &self,
        allocation: AllocationId,
        channel: ChannelNumber,
        peer: SocketAddr,
    ) -> Result<ChannelBinding> {
        self.bind_at(allocation, channel, peer, Instant::now())
    }

    /// Bind `channel` to `peer`, or refresh an identical binding
    pub fn bind_at(
        &self,
        allocation: AllocationId,
        channel: ChannelNumber,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<ChannelBinding> {
        let mut table = self.tables.entry(allocation).or_default();
        table.purge_expired(now);

        if let Some(existing) = table.by_channel.get(&channel) {
            if existing.peer != peer {
                return Err(RelayError::Conflict(format!(
                    "channel {} already bound to {}",
                    channel, existing.peer
                )));
            }
        }
        if let Some(existing) = table.by_peer.get(&peer) {
            if *existing != channel {
                return Err(RelayError::Conflict(format!(
                    "peer {} already bound to channel {}",
                    peer, existing
                )));
            }
        }

        let binding = ChannelBinding {
            channel,
            peer,
            expires_at: now + self.lifetime,
        };
        table.by_channel.insert(channel, binding);
        table.by_peer.insert(peer, channel);
        debug!("Channel {} bound to {} on allocation {}", channel, peer, allocation);

        Ok(binding)
    }

    pub fn resolve(&self, allocation: AllocationId, channel: ChannelNumber) -> Result<SocketAddr> {
        self.resolve_at(allocation, channel, Instant::now())
    }

    pub fn resolve_at(
        &self,
        allocation: AllocationId,
        channel: ChannelNumber,
        now: Instant,
    ) -> Result<SocketAddr> {
        self.tables
            .get(&allocation)
            .and_then(|table| table.live(channel, now).map(|binding| binding.peer))
            .ok_or_else(|| not_bound_channel(channel))
    }

    pub fn resolve_reverse(&self, allocation: AllocationId, peer: SocketAddr) -> Result<ChannelNumber> {
        self.resolve_reverse_at(allocation, peer, Instant::now())
    }

    pub fn resolve_reverse_at(
        &self,
        allocation: AllocationId,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<ChannelNumber> {
        self.tables
            .get(&allocation)
            .and_then(|table| {
                let channel = *table.by_peer.get(&peer)?;
                table.live(channel, now).map(|binding| binding.channel)
            })
            .ok_or_else(|| RelayError::NotBound(format!("no channel bound to {}", peer)))
    }

    /// Resolve a channel and refresh its expiry, as done for relayed traffic
    pub fn use_channel(&self, allocation: AllocationId, channel: ChannelNumber) -> Result<SocketAddr> {
        self.use_channel_at(allocation, channel, Instant::now())
    }

    pub fn use_channel_at(
        &self,
        allocation: AllocationId,
        channel: ChannelNumber,
        now: Instant,
    ) -> Result<SocketAddr> {
        let mut table = self
            .tables
            .get_mut(&allocation)
            .ok_or_else(|| not_bound_channel(channel))?;
        match table.by_channel.get_mut(&channel) {
            Some(binding) if binding.expires_at > now => {
                binding.expires_at = now + self.lifetime;
                Ok(binding.peer)
            }
            _ => Err(not_bound_channel(channel)),
        }
    }

    /// Live bindings of an allocation
    pub fn bindings(&self, allocation: AllocationId) -> Vec<ChannelBinding> {
        let now = Instant::now();
        self.tables
            .get(&allocation)
            .map(|table| {
                table
                    .by_channel
                    .values()
                    .filter(|binding| binding.expires_at > now)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_allocation(&self, allocation: AllocationId) -> usize {
        self.tables
            .remove(&allocation)
            .map_or(0, |(_, table)| table.by_channel.len())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.tables.retain(|_, table| {
            removed += table.purge_expired(now);
            !table.by_channel.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.tables.iter().map(|entry| entry.by_channel.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_bound_channel(channel: ChannelNumber) -> RelayError {
    RelayError::NotBound(format!("channel {} is not bound", channel))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIFETIME: Duration = Duration::from_secs(600);

    fn channel(value: u16) -> ChannelNumber {
        ChannelNumber::new(value).unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_bind_is_idempotent_and_refreshes() {
        let registry = ChannelBindingRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        let now = Instant::now();

        let first = registry
            .bind_at(allocation, channel(0x4000), addr("1.2.3.4:5000"), now)
            .unwrap();
        let later = now + Duration::from_secs(100);
        let second = registry
            .bind_at(allocation, channel(0x4000), addr("1.2.3.4:5000"), later)
            .unwrap();

        assert!(second.expires_at > first.expires_at);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_conflicts() {
        let registry = ChannelBindingRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        registry
            .bind(allocation, channel(0x4000), addr("1.2.3.4:5000"))
            .unwrap();

        let err = registry
            .bind(allocation, channel(0x4000), addr("5.6.7.8:5000"))
            .unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));

        let err = registry
            .bind(allocation, channel(0x4001), addr("1.2.3.4:5000"))
            .unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));

        // Same pairing under another allocation is independent
        assert!(registry
            .bind(AllocationId::new(), channel(0x4000), addr("5.6.7.8:5000"))
            .is_ok());
    }

    #[test]
    fn test_resolve_both_directions() {
        let registry = ChannelBindingRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        registry
            .bind(allocation, channel(0x4abc), addr("1.2.3.4:5000"))
            .unwrap();

        assert_eq!(registry.resolve(allocation, channel(0x4abc)).unwrap(), addr("1.2.3.4:5000"));
        assert_eq!(
            registry.resolve_reverse(allocation, addr("1.2.3.4:5000")).unwrap(),
            channel(0x4abc)
        );
        assert!(matches!(
            registry.resolve(allocation, channel(0x4001)),
            Err(RelayError::NotBound(_))
        ));
        assert!(registry.resolve_reverse(allocation, addr("1.2.3.4:5001")).is_err());
    }

    #[test]
    fn test_expired_binding_frees_channel() {
        let registry = ChannelBindingRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        let now = Instant::now();
        registry
            .bind_at(allocation, channel(0x4000), addr("1.2.3.4:5000"), now)
            .unwrap();

        let expired = now + LIFETIME;
        assert!(registry.resolve_at(allocation, channel(0x4000), expired).is_err());
        assert!(registry
            .bind_at(allocation, channel(0x4000), addr("5.6.7.8:5000"), expired)
            .is_ok());
    }

    #[test]
    fn test_use_channel_refreshes() {
        let registry = ChannelBindingRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        let now = Instant::now();
        registry
            .bind_at(allocation, channel(0x4000), addr("1.2.3.4:5000"), now)
            .unwrap();

        let later = now + Duration::from_secs(500);
        registry.use_channel_at(allocation, channel(0x4000), later).unwrap();
        assert!(registry
            .resolve_at(allocation, channel(0x4000), now + Duration::from_secs(700))
            .is_ok());
    }

    #[test]
    fn test_sweep_and_remove_allocation() {
        let registry = ChannelBindingRegistry::new(LIFETIME);
        let first = AllocationId::new();
        let second = AllocationId::new();
        let now = Instant::now();
        registry
            .bind_at(first, channel(0x4000), addr("1.2.3.4:5000"), now)
            .unwrap();
        registry
            .bind_at(second, channel(0x4000), addr("1.2.3.4:5000"), now)
            .unwrap();

        assert_eq!(registry.remove_allocation(first), 1);
        assert_eq!(registry.sweep_at(now + Duration::from_secs(1)), 0);
        assert_eq!(registry.sweep_at(now + LIFETIME), 1);
        assert!(registry.is_empty());
    }
}
