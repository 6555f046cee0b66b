//! Common protocol types

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Network protocol identifier (EtherType value)
pub type NetworkProtocolId = u16;

/// Transport protocol identifier (IP protocol / next-header value)
pub type TransportProtocolId = u8;

/// EtherType for IPv4
pub const IPV4_PROTOCOL: NetworkProtocolId = 0x0800;
/// EtherType for ARP
pub const ARP_PROTOCOL: NetworkProtocolId = 0x0806;
/// EtherType for IPv6
pub const IPV6_PROTOCOL: NetworkProtocolId = 0x86DD;
/// Pseudo EtherType matching every protocol (ETH_P_ALL)
pub const ALL_PROTOCOLS: NetworkProtocolId = 0x0003;

/// ICMPv4 protocol number
pub const ICMPV4_TRANSPORT: TransportProtocolId = 1;
/// TCP protocol number
pub const TCP_TRANSPORT: TransportProtocolId = 6;
/// UDP protocol number
pub const UDP_TRANSPORT: TransportProtocolId = 17;
/// ICMPv6 protocol number
pub const ICMPV6_TRANSPORT: TransportProtocolId = 58;

/// Link-layer (MAC) address (6 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkAddr(pub [u8; 6]);

impl LinkAddr {
    pub const BROADCAST: LinkAddr = LinkAddr([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    pub const ZERO: LinkAddr = LinkAddr([0, 0, 0, 0, 0, 0]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// Ethernet mapping of an IPv4 multicast group (RFC 1112)
    pub fn ipv4_multicast(addr: Ipv4Addr) -> Self {
        let o = addr.octets();
        LinkAddr([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    /// Ethernet mapping of an IPv6 multicast group (RFC 2464)
    pub fn ipv6_multicast(addr: Ipv6Addr) -> Self {
        let o = addr.octets();
        LinkAddr([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    /// Ethernet mapping of a multicast/broadcast IP destination, if any
    pub fn for_remote_multicast(addr: IpAddr) -> Option<Self> {
        match addr {
            IpAddr::V4(v4) if v4.is_broadcast() => Some(Self::BROADCAST),
            IpAddr::V4(v4) if v4.is_multicast() => Some(Self::ipv4_multicast(v4)),
            IpAddr::V6(v6) if v6.is_multicast() => Some(Self::ipv6_multicast(v6)),
            _ => None,
        }
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error type for link address parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLinkAddrError;

impl fmt::Display for ParseLinkAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid link address")
    }
}

impl std::error::Error for ParseLinkAddrError {}

impl FromStr for LinkAddr {
    type Err = ParseLinkAddrError;

    /// Parse a colon- or hyphen-separated link address
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else {
            return Err(ParseLinkAddrError);
        };

        if parts.len() != 6 {
            return Err(ParseLinkAddrError);
        }

        let mut result = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseLinkAddrError);
            }
            result[i] = u8::from_str_radix(part, 16).map_err(|_| ParseLinkAddrError)?;
        }

        Ok(LinkAddr(result))
    }
}

/// An IP address with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressWithPrefix {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl AddressWithPrefix {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// The subnet this address belongs to
    pub fn subnet(&self) -> Subnet {
        Subnet::from_addr(self.address, self.prefix_len)
    }
}

impl fmt::Display for AddressWithPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// An IP subnet (network address and prefix length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet from any address within it, masking host bits
    pub fn from_addr(addr: IpAddr, prefix_len: u8) -> Self {
        let network = match addr {
            IpAddr::V4(v4) => {
                let mask = prefix_mask_v4(prefix_len);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = prefix_mask_v6(prefix_len);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Self {
            network,
            prefix_len,
        }
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check whether an address falls within this subnet
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(v4)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(v4) & mask == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(v6)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(v6) & mask == u128::from(net)
            }
            _ => false,
        }
    }

    /// The directed broadcast address of an IPv4 subnet
    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        match self.network {
            IpAddr::V4(net) if self.prefix_len < 31 => {
                let mask = prefix_mask_v4(self.prefix_len);
                Some(Ipv4Addr::from(u32::from(net) | !mask))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn prefix_mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len.min(32))
    }
}

fn prefix_mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        !0u128 << (128 - prefix_len.min(128) as u32)
    }
}

/// The IPv6 link-local prefix fe80::/64
pub fn ipv6_link_local_subnet() -> Subnet {
    Subnet::from_addr(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0)), 64)
}

/// True for IPv6 unicast addresses (not unspecified, not multicast)
pub fn is_ipv6_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => !v6.is_unspecified() && !v6.is_multicast(),
        IpAddr::V4(_) => false,
    }
}

/// Solicited-node multicast address for an IPv6 unicast address (RFC 4291)
pub fn solicited_node_multicast(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        0x0001,
        0xff00 | o[13] as u16,
        u16::from_be_bytes([o[14], o[15]]),
    )
}

/// All-routers link-local multicast address ff02::2
pub fn all_routers_multicast() -> Ipv6Addr {
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_addr_broadcast() {
        assert!(LinkAddr::BROADCAST.is_broadcast());
        assert!(LinkAddr::BROADCAST.is_multicast());
        assert!(!LinkAddr::BROADCAST.is_unicast());
    }

    #[test]
    fn test_link_addr_display_and_parse() {
        let addr = LinkAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(format!("{}", addr), "00:11:22:33:44:55");

        let parsed: LinkAddr = "00:11:22:33:44:55".parse().unwrap();
        assert_eq!(parsed, addr);

        let parsed: LinkAddr = "00-11-22-33-44-55".parse().unwrap();
        assert_eq!(parsed, addr);

        assert!("00:11:22:33:44".parse::<LinkAddr>().is_err());
        assert!("00:11:22:33:44:gg".parse::<LinkAddr>().is_err());
    }

    #[test]
    fn test_ipv6_multicast_mapping() {
        let group: Ipv6Addr = "ff02::1:ff00:1234".parse().unwrap();
        let mapped = LinkAddr::ipv6_multicast(group);
        assert_eq!(mapped, LinkAddr([0x33, 0x33, 0xff, 0x00, 0x12, 0x34]));
        assert!(mapped.is_multicast());
    }

    #[test]
    fn test_ipv4_multicast_mapping() {
        let mapped = LinkAddr::ipv4_multicast(Ipv4Addr::new(224, 0, 0, 251));
        assert_eq!(mapped, LinkAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb]));
    }

    #[test]
    fn test_subnet_contains() {
        let subnet = Subnet::from_addr("10.0.0.1".parse().unwrap(), 24);
        assert_eq!(subnet.network(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert!(subnet.contains("10.0.0.99".parse().unwrap()));
        assert!(!subnet.contains("10.0.1.1".parse().unwrap()));
        assert!(!subnet.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_subnet_broadcast() {
        let subnet = Subnet::from_addr("10.0.0.1".parse().unwrap(), 24);
        assert_eq!(subnet.broadcast(), Some(Ipv4Addr::new(10, 0, 0, 255)));

        let v6 = Subnet::from_addr("2001:db8::1".parse().unwrap(), 64);
        assert_eq!(v6.broadcast(), None);
    }

    #[test]
    fn test_subnet_v6() {
        let subnet = Subnet::from_addr("2001:db8::dead:beef".parse().unwrap(), 64);
        assert_eq!(
            subnet.network(),
            "2001:db8::".parse::<IpAddr>().unwrap()
        );
        assert!(subnet.contains("2001:db8::1".parse().unwrap()));
        assert!(!subnet.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_solicited_node_multicast() {
        let addr: Ipv6Addr = "2001:db8::1:800:200e:8c6c".parse().unwrap();
        let snm = solicited_node_multicast(addr);
        assert_eq!(snm, "ff02::1:ff0e:8c6c".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_is_ipv6_unicast() {
        assert!(is_ipv6_unicast("2001:db8::1".parse().unwrap()));
        assert!(is_ipv6_unicast("fe80::1".parse().unwrap()));
        assert!(!is_ipv6_unicast("::".parse().unwrap()));
        assert!(!is_ipv6_unicast("ff02::1".parse().unwrap()));
        assert!(!is_ipv6_unicast("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_link_local_subnet() {
        let ll = ipv6_link_local_subnet();
        assert!(ll.contains("fe80::1234".parse().unwrap()));
        assert!(!ll.contains("2001:db8::1".parse().unwrap()));
    }
}
