//! Blocked destination address ranges.
//!
//! An allowlisted name can still resolve to a private or loopback address
//! (DNS rebinding, split-horizon records). Every address the HTTP listener
//! is about to dial, and every A/AAAA answer the DNS listener relays, is
//! checked against these ranges first.

use super::error::{PolicyError, PolicyResult};
use std::net::IpAddr;

/// Ranges blocked unless the blocker is built without defaults.
pub const DEFAULT_BLOCKED_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`. A bare address is treated as a host route.
    pub fn parse(s: &str) -> PolicyResult<Self> {
        let invalid = || PolicyError::InvalidCidr(s.to_string());

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }

        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }

    /// Whether `ip` falls inside this network.
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        if ip.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask(ip, self.prefix) == self.network
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            IpAddr::V6((bits & m).into())
        }
    }
}

/// Set of blocked ranges consulted before dialing or relaying an address.
#[derive(Debug, Clone, Default)]
pub struct CidrBlocker {
    ranges: Vec<Cidr>,
}

impl CidrBlocker {
    /// Default private ranges plus any extra ranges from configuration.
    pub fn with_defaults<S: AsRef<str>>(extra: &[S]) -> PolicyResult<Self> {
        let mut ranges = DEFAULT_BLOCKED_CIDRS
            .iter()
            .map(|c| Cidr::parse(c))
            .collect::<PolicyResult<Vec<_>>>()?;
        for c in extra {
            ranges.push(Cidr::parse(c.as_ref())?);
        }
        Ok(Self { ranges })
    }

    /// A blocker that blocks nothing. Used when the upstream is local, e.g. tests.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether `ip` is inside any blocked range.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }
}
