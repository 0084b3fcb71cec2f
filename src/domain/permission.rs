//! Permission registry
//!
//! Per-allocation set of peer IP addresses allowed to exchange data through
//! the relay. Permissions are port-agnostic and expire independently.

use super::shared::AllocationId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct PermissionRegistry {
    permissions: DashMap<AllocationId, HashMap<IpAddr, Instant>>,
    lifetime: Duration,
}

impl PermissionRegistry {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            permissions: DashMap::new(),
            lifetime,
        }
    }

    /// Default permission lifetime
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Insert or refresh a permission; returns its new expiry
    pub fn authorize(&self, allocation: AllocationId, peer: IpAddr, duration: Duration) -> Instant {
        self.authorize_at(allocation, peer, duration, Instant::now())
    }

    pub fn authorize_at(
        &self,
        allocation: AllocationId,
        peer: IpAddr,
        duration: Duration,
        now: Instant,
    ) -> Instant {
        let expires_at = now + duration;
        self.permissions
            .entry(allocation)
            .or_default()
            .insert(peer.to_canonical(), expires_at);
        debug!("Permission for {} on allocation {} until {:?}", peer, allocation, duration);
        expires_at
    }

    pub fn is_authorized(&self, allocation: AllocationId, peer: IpAddr) -> bool {
        self.is_authorized_at(allocation, peer, Instant::now())
    }

    pub fn is_authorized_at(&self, allocation: AllocationId, peer: IpAddr, now: Instant) -> bool {
        self.permissions
            .get(&allocation)
            .and_then(|peers| peers.get(&peer.to_canonical()).copied())
            .map_or(false, |expires_at| expires_at > now)
    }

    /// Extend a live permission; returns false when none exists
    pub fn touch(&self, allocation: AllocationId, peer: IpAddr) -> bool {
        self.touch_at(allocation, peer, Instant::now())
    }

    pub fn touch_at(&self, allocation: AllocationId, peer: IpAddr, now: Instant) -> bool {
        let Some(mut peers) = self.permissions.get_mut(&allocation) else {
            return false;
        };
        match peers.get_mut(&peer.to_canonical()) {
            Some(expires_at) if *expires_at > now => {
                *expires_at = now + self.lifetime;
                true
            }
            _ => false,
        }
    }

    /// Live permitted peers of an allocation
    pub fn peers(&self, allocation: AllocationId) -> Vec<IpAddr> {
        let now = Instant::now();
        self.permissions
            .get(&allocation)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(ip, _)| *ip)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every permission owned by an allocation
    pub fn remove_allocation(&self, allocation: AllocationId) -> usize {
        self.permissions
            .remove(&allocation)
            .map_or(0, |(_, peers)| peers.len())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Expire stale permissions; returns how many were removed
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.permissions.retain(|_, peers| {
            let before = peers.len();
            peers.retain(|_, expires_at| *expires_at > now);
            removed += before - peers.len();
            !peers.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.permissions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIFETIME: Duration = Duration::from_secs(300);

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_authorize_and_expire() {
        let registry = PermissionRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        let now = Instant::now();

        registry.authorize_at(allocation, ip("1.2.3.4"), LIFETIME, now);

        assert!(registry.is_authorized_at(allocation, ip("1.2.3.4"), now));
        assert!(!registry.is_authorized_at(allocation, ip("5.6.7.8"), now));
        assert!(!registry.is_authorized_at(AllocationId::new(), ip("1.2.3.4"), now));
        assert!(!registry.is_authorized_at(allocation, ip("1.2.3.4"), now + LIFETIME));
    }

    #[test]
    fn test_permission_is_port_agnostic_and_canonical() {
        let registry = PermissionRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        registry.authorize(allocation, ip("::ffff:10.0.0.1"), LIFETIME);
        assert!(registry.is_authorized(allocation, ip("10.0.0.1")));
    }

    #[test]
    fn test_touch_extends_only_live_permissions() {
        let registry = PermissionRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        let now = Instant::now();

        assert!(!registry.touch_at(allocation, ip("1.2.3.4"), now));

        registry.authorize_at(allocation, ip("1.2.3.4"), LIFETIME, now);
        let later = now + Duration::from_secs(200);
        assert!(registry.touch_at(allocation, ip("1.2.3.4"), later));
        assert!(registry.is_authorized_at(allocation, ip("1.2.3.4"), now + Duration::from_secs(400)));
        assert!(!registry.touch_at(allocation, ip("1.2.3.4"), later + LIFETIME));
    }

    #[test]
    fn test_sweep() {
        let registry = PermissionRegistry::new(LIFETIME);
        let allocation = AllocationId::new();
        let now = Instant::now();

        registry.authorize_at(allocation, ip("1.2.3.4"), Duration::from_secs(10), now);
        registry.authorize_at(allocation, ip("5.6.7.8"), LIFETIME, now);

        assert_eq!(registry.sweep_at(now + Duration::from_secs(60)), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sweep_at(now + LIFETIME), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_allocation() {
        let registry = PermissionRegistry::new(LIFETIME);
        let first = AllocationId::new();
        let second = AllocationId::new();
        registry.authorize(first, ip("1.2.3.4"), LIFETIME);
        registry.authorize(second, ip("1.2.3.4"), LIFETIME);

        assert_eq!(registry.remove_allocation(first), 1);
        assert!(!registry.is_authorized(first, ip("1.2.3.4")));
        assert!(registry.is_authorized(second, ip("1.2.3.4")));
        assert_eq!(registry.peers(second), vec![ip("1.2.3.4")]);
    }
}
