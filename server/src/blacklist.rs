//! Time-boxed deny list consulted before anything else looks at a datagram.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::info;

use crate::canonical_ip;

pub const DEFAULT_BAN_TTL: Duration = Duration::from_secs(30);

/// Most entries a single periodic sweep removes.
pub const DEFAULT_SWEEP_BUDGET: usize = 1024;

/// Bans keyed by source address. IPv4-mapped IPv6 sources share the entry
/// of their IPv4 form; other ports of the same host are not affected.
#[derive(Debug)]
pub struct AddressBlacklist {
    entries: DashMap<SocketAddr, Instant>,
    default_ttl: Duration,
}

impl AddressBlacklist {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn ban(&self, addr: SocketAddr) {
        self.ban_for(addr, self.default_ttl);
    }

    pub fn ban_for(&self, addr: SocketAddr, ttl: Duration) {
        self.ban_at(addr, ttl, Instant::now());
    }

    /// Bans `addr` until `now + ttl`. A longer existing ban is kept.
    pub fn ban_at(&self, addr: SocketAddr, ttl: Duration, now: Instant) {
        let addr = canonical_addr(addr);
        let expiry = now + ttl;
        let mut entry = self.entries.entry(addr).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
        info!("Banned {} for {:?}", addr, ttl);
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        self.is_banned_at(addr, Instant::now())
    }

    /// Expired entries found here are evicted on the spot.
    pub fn is_banned_at(&self, addr: SocketAddr, now: Instant) -> bool {
        let addr = canonical_addr(addr);
        let expiry = match self.entries.get(&addr) {
            Some(entry) => *entry,
            None => return false,
        };
        if now < expiry {
            return true;
        }
        self.entries.remove_if(&addr, |_, expiry| now >= *expiry);
        false
    }

    pub fn unban(&self, addr: SocketAddr) -> bool {
        self.entries.remove(&canonical_addr(addr)).is_some()
    }

    pub fn sweep(&self, budget: usize) -> usize {
        self.sweep_at(budget, Instant::now())
    }

    /// Removes up to `budget` expired entries and returns how many went.
    pub fn sweep_at(&self, budget: usize, now: Instant) -> usize {
        let expired: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|entry| now >= *entry.value())
            .take(budget)
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter(|addr| self.entries.remove_if(addr, |_, expiry| now >= *expiry).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AddressBlacklist {
    fn default() -> Self {
        Self::new(DEFAULT_BAN_TTL)
    }
}

fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 40000)
    }

    #[test]
    fn test_ban_and_expire() {
        let blacklist = AddressBlacklist::default();
        blacklist.ban_for(addr(1), Duration::from_millis(50));
        assert!(blacklist.is_banned(addr(1)));
        assert!(!blacklist.is_banned(addr(2)));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!blacklist.is_banned(addr(1)));
        assert!(blacklist.is_empty());
    }

    #[test]
    fn test_ban_one_second() {
        let blacklist = AddressBlacklist::default();
        let now = Instant::now();
        blacklist.ban_at(addr(1), Duration::from_secs(1), now);
        assert!(blacklist.is_banned_at(addr(1), now));
        assert!(blacklist.is_banned_at(addr(1), now + Duration::from_millis(999)));
        assert!(!blacklist.is_banned_at(addr(1), now + Duration::from_millis(1001)));
        assert_eq!(blacklist.len(), 0);
    }

    #[test]
    fn test_unban() {
        let blacklist = AddressBlacklist::default();
        blacklist.ban(addr(3));
        assert!(blacklist.unban(addr(3)));
        assert!(!blacklist.is_banned(addr(3)));
        assert!(!blacklist.unban(addr(3)));
    }

    #[test]
    fn test_longer_ban_wins() {
        let blacklist = AddressBlacklist::default();
        let now = Instant::now();
        blacklist.ban_at(addr(4), Duration::from_secs(60), now);
        blacklist.ban_at(addr(4), Duration::from_secs(1), now);
        assert!(blacklist.is_banned_at(addr(4), now + Duration::from_secs(30)));
    }

    #[test]
    fn test_other_port_same_host_not_banned() {
        let blacklist = AddressBlacklist::default();
        let banned = addr(6);
        blacklist.ban(banned);
        assert!(blacklist.is_banned(banned));
        assert!(!blacklist.is_banned(SocketAddr::new(banned.ip(), banned.port() + 1)));
    }

    #[test]
    fn test_mapped_ipv6_shares_entry() {
        let blacklist = AddressBlacklist::default();
        blacklist.ban(addr(5));
        let mapped = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped()),
            40000,
        );
        assert!(blacklist.is_banned(mapped));
        assert!(!blacklist.is_banned(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 40000)));
    }

    #[test]
    fn test_sweep_respects_budget() {
        let blacklist = AddressBlacklist::default();
        let now = Instant::now();
        for last in 0..10 {
            blacklist.ban_at(addr(last), Duration::from_secs(1), now);
        }
        blacklist.ban_at(addr(200), Duration::from_secs(600), now);

        let later = now + Duration::from_secs(2);
        assert_eq!(blacklist.sweep_at(4, later), 4);
        assert_eq!(blacklist.len(), 7);
        assert_eq!(blacklist.sweep_at(DEFAULT_SWEEP_BUDGET, later), 6);
        assert_eq!(blacklist.len(), 1);
        assert!(blacklist.is_banned_at(addr(200), later));
    }
}
