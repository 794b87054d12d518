//! IPv4 subnet arithmetic.

use std::net::Ipv4Addr;

use crate::error::ClusterError;

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Parse `a.b.c.d/n`. Host bits are cleared.
    ///
    /// # Errors
    /// Returns a configuration error for malformed CIDRs and for prefixes
    /// that leave no room for a gateway plus one host.
    pub fn parse(cidr: &str) -> Result<Self, ClusterError> {
        let invalid = |why: &str| ClusterError::Configuration(format!("invalid subnet '{cidr}': {why}"));

        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected CIDR notation"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
        if prefix_len > 30 {
            return Err(invalid("prefix length must be at most 30"));
        }

        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix_len))
    }

    /// First host address, used as the gateway.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Default DHCP range: network + 10 (or the first host after the
    /// gateway on small subnets) up to the last host.
    #[must_use]
    pub fn default_dhcp_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        let net = u32::from(self.network);
        let last = u32::from(self.broadcast()) - 1;
        let start = if net + 10 <= last { net + 10 } else { net + 2 };
        (Ipv4Addr::from(start), Ipv4Addr::from(last))
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix_len) == u32::from(self.network)
    }

    /// True for addresses usable by a host (not network or broadcast).
    #[must_use]
    pub fn is_host(&self, ip: Ipv4Addr) -> bool {
        self.contains(ip) && ip != self.network && ip != self.broadcast()
    }

    /// Every host address, ascending.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network) + 1;
        let last = u32::from(self.broadcast()) - 1;
        (first..=last).map(Ipv4Addr::from)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}
