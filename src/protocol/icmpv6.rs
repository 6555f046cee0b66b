//! ICMPv6 NDP messages - RFC 4443, RFC 4861
//!
//! Builders and parsers for the Neighbor Discovery messages an interface
//! originates (NS for DAD, RS for router discovery) and consumes (NA, RA).

use super::LinkAddr;
use crate::{Error, Result};
use std::net::Ipv6Addr;

/// Minimum ICMPv6 header size
pub const MIN_HEADER_SIZE: usize = 4;

/// Neighbor Solicitation/Advertisement message size (without options)
pub const NDP_MSG_SIZE: usize = 24; // 4 (header) + 4 (reserved/flags) + 16 (target)

/// ICMPv6 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Icmpv6Type {
    RouterSolicitation = 133,
    RouterAdvertisement = 134,
    NeighborSolicitation = 135,
    NeighborAdvertisement = 136,
}

impl Icmpv6Type {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            133 => Some(Icmpv6Type::RouterSolicitation),
            134 => Some(Icmpv6Type::RouterAdvertisement),
            135 => Some(Icmpv6Type::NeighborSolicitation),
            136 => Some(Icmpv6Type::NeighborAdvertisement),
            _ => None,
        }
    }
}

/// NDP option types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NdpOptionType {
    SourceLinkLayerAddress = 1,
    TargetLinkLayerAddress = 2,
    PrefixInformation = 3,
}

/// Neighbor Solicitation message (RFC 4861 section 4.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSolicitation {
    /// Address whose link-layer address is solicited
    pub target_addr: Ipv6Addr,
    /// Source link-layer address option (absent for DAD probes)
    pub source_link_addr: Option<LinkAddr>,
}

impl NeighborSolicitation {
    pub fn new(target_addr: Ipv6Addr, source_link_addr: Option<LinkAddr>) -> Self {
        Self {
            target_addr,
            source_link_addr,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < NDP_MSG_SIZE {
            return Err(Error::Parse("NS message too short".into()));
        }
        if buffer[0] != Icmpv6Type::NeighborSolicitation as u8 {
            return Err(Error::Parse("not a Neighbor Solicitation".into()));
        }

        let mut target = [0u8; 16];
        target.copy_from_slice(&buffer[8..24]);

        let source_link_addr =
            parse_link_addr_option(&buffer[NDP_MSG_SIZE..], NdpOptionType::SourceLinkLayerAddress);

        Ok(Self {
            target_addr: Ipv6Addr::from(target),
            source_link_addr,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NDP_MSG_SIZE + 8);
        buf.push(Icmpv6Type::NeighborSolicitation as u8);
        buf.push(0); // code
        buf.extend_from_slice(&[0, 0]); // checksum (filled in later)
        buf.extend_from_slice(&[0, 0, 0, 0]); // reserved
        buf.extend_from_slice(&self.target_addr.octets());

        if let Some(mac) = self.source_link_addr {
            buf.push(NdpOptionType::SourceLinkLayerAddress as u8);
            buf.push(1); // length in units of 8 bytes
            buf.extend_from_slice(&mac.0);
        }

        buf
    }
}

/// Neighbor Advertisement message (RFC 4861 section 4.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborAdvertisement {
    pub target_addr: Ipv6Addr,
    pub target_link_addr: Option<LinkAddr>,
    pub router_flag: bool,
    pub solicited_flag: bool,
    pub override_flag: bool,
}

impl NeighborAdvertisement {
    pub fn new(
        target_addr: Ipv6Addr,
        target_link_addr: Option<LinkAddr>,
        router_flag: bool,
        solicited_flag: bool,
        override_flag: bool,
    ) -> Self {
        Self {
            target_addr,
            target_link_addr,
            router_flag,
            solicited_flag,
            override_flag,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < NDP_MSG_SIZE {
            return Err(Error::Parse("NA message too short".into()));
        }
        if buffer[0] != Icmpv6Type::NeighborAdvertisement as u8 {
            return Err(Error::Parse("not a Neighbor Advertisement".into()));
        }

        let flags = buffer[4];
        let mut target = [0u8; 16];
        target.copy_from_slice(&buffer[8..24]);

        let target_link_addr =
            parse_link_addr_option(&buffer[NDP_MSG_SIZE..], NdpOptionType::TargetLinkLayerAddress);

        Ok(Self {
            target_addr: Ipv6Addr::from(target),
            target_link_addr,
            router_flag: flags & 0x80 != 0,
            solicited_flag: flags & 0x40 != 0,
            override_flag: flags & 0x20 != 0,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NDP_MSG_SIZE + 8);
        buf.push(Icmpv6Type::NeighborAdvertisement as u8);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]);

        let mut flags = 0u8;
        if self.router_flag {
            flags |= 0x80;
        }
        if self.solicited_flag {
            flags |= 0x40;
        }
        if self.override_flag {
            flags |= 0x20;
        }
        buf.push(flags);
        buf.extend_from_slice(&[0, 0, 0]); // reserved
        buf.extend_from_slice(&self.target_addr.octets());

        if let Some(mac) = self.target_link_addr {
            buf.push(NdpOptionType::TargetLinkLayerAddress as u8);
            buf.push(1);
            buf.extend_from_slice(&mac.0);
        }

        buf
    }
}

/// Router Solicitation message (RFC 4861 section 4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSolicitation {
    pub source_link_addr: Option<LinkAddr>,
}

impl RouterSolicitation {
    pub fn new(source_link_addr: Option<LinkAddr>) -> Self {
        Self { source_link_addr }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < 8 {
            return Err(Error::Parse("RS message too short".into()));
        }
        if buffer[0] != Icmpv6Type::RouterSolicitation as u8 {
            return Err(Error::Parse("not a Router Solicitation".into()));
        }

        let source_link_addr =
            parse_link_addr_option(&buffer[8..], NdpOptionType::SourceLinkLayerAddress);

        Ok(Self { source_link_addr })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(Icmpv6Type::RouterSolicitation as u8);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.extend_from_slice(&[0, 0, 0, 0]); // reserved

        if let Some(mac) = self.source_link_addr {
            buf.push(NdpOptionType::SourceLinkLayerAddress as u8);
            buf.push(1);
            buf.extend_from_slice(&mac.0);
        }

        buf
    }
}

/// Prefix Information option (RFC 4861 section 4.6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixInformation {
    pub prefix: Ipv6Addr,
    pub prefix_length: u8,
    pub on_link_flag: bool,
    pub autonomous_flag: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

impl PrefixInformation {
    pub fn new(
        prefix: Ipv6Addr,
        prefix_length: u8,
        on_link_flag: bool,
        autonomous_flag: bool,
        valid_lifetime: u32,
        preferred_lifetime: u32,
    ) -> Self {
        Self {
            prefix,
            prefix_length,
            on_link_flag,
            autonomous_flag,
            valid_lifetime,
            preferred_lifetime,
        }
    }

    /// Parse the option body (after the type/length bytes)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 30 {
            return Err(Error::Parse("prefix information option too short".into()));
        }

        let prefix_length = data[0];
        let flags = data[1];
        let valid_lifetime = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let preferred_lifetime = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&data[14..30]);

        Ok(Self {
            prefix: Ipv6Addr::from(prefix),
            prefix_length,
            on_link_flag: flags & 0x80 != 0,
            autonomous_flag: flags & 0x40 != 0,
            valid_lifetime,
            preferred_lifetime,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(NdpOptionType::PrefixInformation as u8);
        buf.push(4); // 32 bytes
        buf.push(self.prefix_length);
        let mut flags = 0u8;
        if self.on_link_flag {
            flags |= 0x80;
        }
        if self.autonomous_flag {
            flags |= 0x40;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.valid_lifetime.to_be_bytes());
        buf.extend_from_slice(&self.preferred_lifetime.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]); // reserved
        buf.extend_from_slice(&self.prefix.octets());
        buf
    }
}

/// Router Advertisement message (RFC 4861 section 4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvertisement {
    pub cur_hop_limit: u8,
    pub managed_flag: bool,
    pub other_flag: bool,
    /// Lifetime of this router as a default router, in seconds. Zero means
    /// the router is not a default router.
    pub router_lifetime: u16,
    pub reachable_time: u32,
    pub retrans_timer: u32,
    pub source_link_addr: Option<LinkAddr>,
    pub prefixes: Vec<PrefixInformation>,
}

impl RouterAdvertisement {
    pub fn new(cur_hop_limit: u8, router_lifetime: u16) -> Self {
        Self {
            cur_hop_limit,
            managed_flag: false,
            other_flag: false,
            router_lifetime,
            reachable_time: 0,
            retrans_timer: 0,
            source_link_addr: None,
            prefixes: Vec::new(),
        }
    }

    pub fn with_source_link_addr(mut self, mac: LinkAddr) -> Self {
        self.source_link_addr = Some(mac);
        self
    }

    pub fn with_prefix(mut self, prefix: PrefixInformation) -> Self {
        self.prefixes.push(prefix);
        self
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < 16 {
            return Err(Error::Parse("RA message too short".into()));
        }
        if buffer[0] != Icmpv6Type::RouterAdvertisement as u8 {
            return Err(Error::Parse("not a Router Advertisement".into()));
        }

        let cur_hop_limit = buffer[4];
        let flags = buffer[5];
        let router_lifetime = u16::from_be_bytes([buffer[6], buffer[7]]);
        let reachable_time = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);
        let retrans_timer = u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]);

        let mut ra = Self {
            cur_hop_limit,
            managed_flag: flags & 0x80 != 0,
            other_flag: flags & 0x40 != 0,
            router_lifetime,
            reachable_time,
            retrans_timer,
            source_link_addr: None,
            prefixes: Vec::new(),
        };

        // Walk options
        let mut rest = &buffer[16..];
        while rest.len() >= 2 {
            let opt_type = rest[0];
            let opt_len = rest[1] as usize * 8;
            if opt_len == 0 || rest.len() < opt_len {
                return Err(Error::Parse("malformed NDP option".into()));
            }

            match opt_type {
                t if t == NdpOptionType::SourceLinkLayerAddress as u8 => {
                    if opt_len >= 8 {
                        let mut mac = [0u8; 6];
                        mac.copy_from_slice(&rest[2..8]);
                        ra.source_link_addr = Some(LinkAddr(mac));
                    }
                }
                t if t == NdpOptionType::PrefixInformation as u8 => {
                    if opt_len == 32 {
                        ra.prefixes.push(PrefixInformation::parse(&rest[2..32])?);
                    }
                }
                _ => {} // unknown options are skipped
            }

            rest = &rest[opt_len..];
        }

        Ok(ra)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 8 + 32 * self.prefixes.len());
        buf.push(Icmpv6Type::RouterAdvertisement as u8);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.push(self.cur_hop_limit);
        let mut flags = 0u8;
        if self.managed_flag {
            flags |= 0x80;
        }
        if self.other_flag {
            flags |= 0x40;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.router_lifetime.to_be_bytes());
        buf.extend_from_slice(&self.reachable_time.to_be_bytes());
        buf.extend_from_slice(&self.retrans_timer.to_be_bytes());

        if let Some(mac) = self.source_link_addr {
            buf.push(NdpOptionType::SourceLinkLayerAddress as u8);
            buf.push(1);
            buf.extend_from_slice(&mac.0);
        }
        for prefix in &self.prefixes {
            buf.extend_from_slice(&prefix.to_bytes());
        }

        buf
    }
}

/// Scan NDP options for a link-layer address option of the given type
fn parse_link_addr_option(mut rest: &[u8], wanted: NdpOptionType) -> Option<LinkAddr> {
    while rest.len() >= 2 {
        let opt_type = rest[0];
        let opt_len = rest[1] as usize * 8;
        if opt_len == 0 || rest.len() < opt_len {
            return None;
        }
        if opt_type == wanted as u8 && opt_len >= 8 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&rest[2..8]);
            return Some(LinkAddr(mac));
        }
        rest = &rest[opt_len..];
    }
    None
}

/// Compute the ICMPv6 checksum over the pseudo-header and message
pub fn calculate_checksum(src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr, icmpv6_data: &[u8]) -> u16 {
    let mut sum = 0u32;

    for chunk in src_addr.octets().chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    for chunk in dst_addr.octets().chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // Upper-layer packet length and next header (58)
    let len = icmpv6_data.len() as u32;
    sum += len >> 16;
    sum += len & 0xffff;
    sum += 58;

    let mut chunks = icmpv6_data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Fill in the checksum field of a serialized ICMPv6 message
pub fn set_checksum(buffer: &mut [u8], src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr) {
    buffer[2] = 0;
    buffer[3] = 0;
    let checksum = calculate_checksum(src_addr, dst_addr, buffer);
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
}

/// Verify the checksum of a received ICMPv6 message
pub fn validate_checksum(src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr, icmpv6_data: &[u8]) -> bool {
    calculate_checksum(src_addr, dst_addr, icmpv6_data) == 0
}
