//! In-memory lease registry
//!
//! Maps owner ids to lease metadata. The registry itself is not
//! synchronised; the tunnel manager keeps it behind its single lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::controller::Target;

/// One caller's claim on the shared tunnel
#[derive(Debug, Clone)]
pub struct Lease {
    pub owner_id: String,
    /// Bumped every time the lease is granted again, so a handle from an
    /// earlier grant cannot release a later one
    pub grant: u64,
    pub owner_kind: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
    pub device_ip: String,
    pub username: String,
}

impl Lease {
    pub fn new(
        owner_id: impl Into<String>,
        owner_kind: impl Into<String>,
        port: u16,
        target: &Target,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            grant: 0,
            owner_kind: owner_kind.into(),
            port,
            created_at: now,
            last_heartbeat: now,
            ttl,
            expires_at: deadline(now, ttl),
            device_ip: target.device_ip.clone(),
            username: target.username.clone(),
        }
    }

    /// Push the expiry out by `ttl` (or the lease's current ttl) from `now`
    pub fn renew(&mut self, ttl: Option<Duration>, now: DateTime<Utc>) {
        if let Some(ttl) = ttl {
            self.ttl = ttl;
        }
        self.expires_at = deadline(now, self.ttl);
        self.last_heartbeat = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn view(&self) -> LeaseView {
        LeaseView {
            owner_id: self.owner_id.clone(),
            owner_kind: self.owner_kind.clone(),
            port: self.port,
            created_at: self.created_at,
            expires_at: self.expires_at,
            ttl: self.ttl,
            device_ip: self.device_ip.clone(),
            username: self.username.clone(),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Read-only snapshot of a lease, detached from the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseView {
    pub owner_id: String,
    pub owner_kind: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
    pub device_ip: String,
    pub username: String,
    pub last_heartbeat: DateTime<Utc>,
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: HashMap<String, Lease>,
    last_grant: u64,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_grant(&mut self) -> u64 {
        self.last_grant += 1;
        self.last_grant
    }

    pub fn get(&self, owner_id: &str) -> Option<&Lease> {
        self.leases.get(owner_id)
    }

    pub fn contains(&self, owner_id: &str) -> bool {
        self.leases.contains_key(owner_id)
    }

    /// Insert a lease under a fresh grant number and return that number
    pub fn insert(&mut self, mut lease: Lease) -> u64 {
        let grant = self.next_grant();
        lease.grant = grant;
        self.leases.insert(lease.owner_id.clone(), lease);
        grant
    }

    /// Renew an existing lease. Returns false for unknown owners.
    pub fn renew(&mut self, owner_id: &str, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match self.leases.get_mut(owner_id) {
            Some(lease) => {
                lease.renew(ttl, now);
                true
            }
            None => false,
        }
    }

    /// Renew an existing lease and hand it out under a new grant number.
    /// Returns `None` for unknown owners.
    pub fn regrant(
        &mut self,
        owner_id: &str,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        if !self.leases.contains_key(owner_id) {
            return None;
        }
        let grant = self.next_grant();
        let lease = self.leases.get_mut(owner_id)?;
        lease.renew(ttl, now);
        lease.grant = grant;
        Some(grant)
    }

    pub fn remove(&mut self, owner_id: &str) -> Option<Lease> {
        self.leases.remove(owner_id)
    }

    /// Remove the lease only if it is still held under `grant`
    pub fn remove_grant(&mut self, owner_id: &str, grant: u64) -> Option<Lease> {
        match self.leases.get(owner_id) {
            Some(lease) if lease.grant == grant => self.leases.remove(owner_id),
            _ => None,
        }
    }

    /// Remove and return every lease whose expiry is at or before `now`
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        let expired: Vec<String> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.owner_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|owner_id| self.leases.remove(&owner_id))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// Views of all leases, oldest first
    pub fn snapshot(&self) -> Vec<LeaseView> {
        let mut views: Vec<LeaseView> = self.leases.values().map(Lease::view).collect();
        views.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.owner_id.cmp(&b.owner_id))
        });
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new("10.0.0.5", "admin", "x")
    }

    fn lease(owner: &str, ttl_secs: u64, now: DateTime<Utc>) -> Lease {
        Lease::new(owner, "test-run", 1161, &target(), Duration::from_secs(ttl_secs), now)
    }

    #[test]
    fn test_new_lease_fields() {
        let now = Utc::now();
        let lease = lease("job-1", 60, now);

        assert_eq!(lease.created_at, now);
        assert_eq!(lease.last_heartbeat, now);
        assert_eq!(lease.expires_at, now + chrono::Duration::seconds(60));
        assert_eq!(lease.device_ip, "10.0.0.5");
        assert_eq!(lease.username, "admin");
    }

    #[test]
    fn test_renew_keeps_ttl_when_not_given() {
        let now = Utc::now();
        let mut lease = lease("job-1", 60, now);
        let later = now + chrono::Duration::seconds(10);

        lease.renew(None, later);
        assert_eq!(lease.ttl, Duration::from_secs(60));
        assert_eq!(lease.expires_at, later + chrono::Duration::seconds(60));
        assert_eq!(lease.last_heartbeat, later);

        lease.renew(Some(Duration::from_secs(5)), later);
        assert_eq!(lease.ttl, Duration::from_secs(5));
        assert_eq!(lease.expires_at, later + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let now = Utc::now();
        let lease = Lease::new("job", "utility", 1161, &target(), Duration::MAX, now);
        assert_eq!(lease.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_registry_renew_unknown_owner() {
        let mut registry = LeaseRegistry::new();
        assert!(!registry.renew("ghost", None, Utc::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_regrant_invalidates_earlier_grant() {
        let now = Utc::now();
        let mut registry = LeaseRegistry::new();

        let first = registry.insert(lease("probe", 60, now));
        let second = registry.regrant("probe", None, now).unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.regrant("ghost", None, now), None);

        assert!(registry.remove_grant("probe", first).is_none());
        assert!(registry.contains("probe"));
        assert!(registry.remove_grant("probe", second).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_expired_boundary() {
        let now = Utc::now();
        let mut registry = LeaseRegistry::new();
        registry.insert(lease("short", 1, now));
        registry.insert(lease("long", 60, now));

        // Expiry is inclusive
        let expired = registry.remove_expired(now + chrono::Duration::seconds(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].owner_id, "short");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("long"));
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let now = Utc::now();
        let mut registry = LeaseRegistry::new();
        registry.insert(lease("b", 60, now + chrono::Duration::seconds(1)));
        registry.insert(lease("a", 60, now));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].owner_id, "a");
        assert_eq!(snapshot[1].owner_id, "b");

        registry.remove("a");
        assert_eq!(snapshot.len(), 2);
    }
}
