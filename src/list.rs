//! LIST — the decision engine: a CIDR-aware whitelist and a timestamped
//! blacklist, each behind its own reader/writer lock.

use crate::error::ListError;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Either a single address or a CIDR network, the two forms an operator may
/// type at the whitelist/blacklist/remove/query command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrOrCidr {
    Addr(Ipv4Addr),
    Cidr(Ipv4Net),
}

impl AddrOrCidr {
    pub fn to_canonical_string(self) -> String {
        match self {
            AddrOrCidr::Addr(a) => a.to_string(),
            AddrOrCidr::Cidr(n) => n.to_string(),
        }
    }
}

/// Parse a string as either a bare IPv4 address or a CIDR network.
pub fn parse_addr_or_cidr(s: &str) -> Result<AddrOrCidr, ListError> {
    if let Ok(addr) = Ipv4Addr::from_str(s) {
        return Ok(AddrOrCidr::Addr(addr));
    }
    if let Ok(net) = Ipv4Net::from_str(s) {
        return Ok(AddrOrCidr::Cidr(net));
    }
    Err(ListError::InvalidAddress(s.to_string()))
}

/// CIDR+IP whitelist. Exact addresses and networks are tracked in separate
/// sets so a network lookup never has to touch the (larger) exact set.
#[derive(Default)]
struct WhitelistInner {
    addrs: std::collections::HashSet<Ipv4Addr>,
    nets: std::collections::HashSet<Ipv4Net>,
}

pub struct Whitelist {
    inner: RwLock<WhitelistInner>,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::new()
    }
}

impl Whitelist {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(WhitelistInner::default()),
        }
    }

    /// True if `addr` is an exact match or contained by any registered network.
    pub fn lookup(&self, addr: Ipv4Addr) -> bool {
        let inner = self.inner.read();
        if inner.addrs.contains(&addr) {
            return true;
        }
        inner.nets.iter().any(|net| net.contains(&addr))
    }

    pub fn add(&self, s: &str) -> Result<(), ListError> {
        match parse_addr_or_cidr(s)? {
            AddrOrCidr::Addr(a) => {
                self.inner.write().addrs.insert(a);
            }
            AddrOrCidr::Cidr(n) => {
                self.inner.write().nets.insert(n);
            }
        }
        Ok(())
    }

    pub fn remove(&self, s: &str) {
        match parse_addr_or_cidr(s) {
            Ok(AddrOrCidr::Addr(a)) => {
                self.inner.write().addrs.remove(&a);
            }
            Ok(AddrOrCidr::Cidr(n)) => {
                self.inner.write().nets.remove(&n);
            }
            Err(_) => {}
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.addrs.len() + inner.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Timestamped blacklist: exact addresses only, each with a last-seen time.
#[derive(Default)]
pub struct Blacklist {
    ip: RwLock<HashMap<Ipv4Addr, DateTime<Utc>>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, addr: Ipv4Addr) -> bool {
        self.ip.read().contains_key(&addr)
    }

    pub fn lookup_with_ts(&self, addr: Ipv4Addr) -> Option<DateTime<Utc>> {
        self.ip.read().get(&addr).copied()
    }

    /// Networks are not blacklistable; `s` must parse as a bare address.
    pub fn add(&self, s: &str, ts: DateTime<Utc>) -> Result<(), ListError> {
        match parse_addr_or_cidr(s)? {
            AddrOrCidr::Addr(a) => {
                self.ip.write().insert(a, ts);
                Ok(())
            }
            AddrOrCidr::Cidr(_) => Err(ListError::NetworkNotBlacklistable(s.to_string())),
        }
    }

    pub fn remove(&self, s: &str) {
        if let Ok(addr) = Ipv4Addr::from_str(s) {
            self.ip.write().remove(&addr);
        }
    }

    pub fn len(&self) -> usize {
        self.ip.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Ipv4Addr> {
        self.ip.read().keys().copied().collect()
    }

    /// Evict every entry whose `ts + duration < now`; returns the count removed.
    pub fn expire(&self, duration: chrono::Duration) -> usize {
        let now = Utc::now();
        let mut ip = self.ip.write();
        let before = ip.len();
        ip.retain(|_, ts| *ts + duration >= now);
        before - ip.len()
    }
}

/// The two tables bundled together, mirroring how SERVER hands them out to
/// FILTER and QUEUE as a single read-shared handle.
#[derive(Default)]
pub struct WbList {
    pub w: Whitelist,
    pub b: Blacklist,
}

impl WbList {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_exact_and_cidr() {
        let w = Whitelist::new();
        w.add("10.1.2.3").unwrap();
        w.add("192.168.0.0/16").unwrap();
        assert!(w.lookup("10.1.2.3".parse().unwrap()));
        assert!(w.lookup("192.168.5.9".parse().unwrap()));
        assert!(!w.lookup("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn whitelist_remove() {
        let w = Whitelist::new();
        w.add("10.1.2.3").unwrap();
        w.remove("10.1.2.3");
        assert!(!w.lookup("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn whitelist_invalid_input() {
        let w = Whitelist::new();
        assert!(w.add("not-an-ip").is_err());
    }

    #[test]
    fn blacklist_rejects_networks() {
        let b = Blacklist::new();
        assert!(b.add("10.0.0.0/8", Utc::now()).is_err());
    }

    #[test]
    fn blacklist_expire_monotonic() {
        let b = Blacklist::new();
        let old = Utc::now() - chrono::Duration::hours(25);
        let fresh = Utc::now();
        b.add("198.51.100.1", old).unwrap();
        b.add("198.51.100.2", fresh).unwrap();
        let removed = b.expire(chrono::Duration::hours(24));
        assert_eq!(removed, 1);
        assert!(!b.lookup("198.51.100.1".parse().unwrap()));
        assert!(b.lookup("198.51.100.2".parse().unwrap()));
    }

    #[test]
    fn blacklist_lookup_with_ts() {
        let b = Blacklist::new();
        let ts = Utc::now();
        b.add("198.51.100.7", ts).unwrap();
        let found_ts = b.lookup_with_ts("198.51.100.7".parse().unwrap()).unwrap();
        assert_eq!(found_ts, ts);
    }
}
