//! Packet buffer
//!
//! A contiguous buffer with reserved headroom and header region bookkeeping.
//! Protocol parse routines consume header regions off the front; the link
//! layer prepends its header into the headroom on egress.

/// How a delivered packet relates to this host (subset of Linux sll_pkttype)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Packet addressed to this host
    Host,
    /// Packet originated by this host
    Outgoing,
}

/// A packet moving through the stack
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    /// Backing storage. Bytes before `start` are unused headroom.
    buffer: Vec<u8>,
    /// Offset of the first valid byte
    start: usize,
    /// Offset of the unconsumed payload (advanced as headers are parsed)
    payload: usize,
    link_header: Option<(usize, usize)>,
    network_header: Option<(usize, usize)>,
    transport_header: Option<(usize, usize)>,
    /// How the packet was delivered, for packet-socket observers
    pub pkt_type: PacketType,
}

impl PacketBuffer {
    /// Wrap received bytes with no headroom
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            buffer: data,
            start: 0,
            payload: 0,
            link_header: None,
            network_header: None,
            transport_header: None,
            pkt_type: PacketType::Host,
        }
    }

    /// Build a packet with `reserve` bytes of headroom before `payload`
    pub fn with_headroom(reserve: usize, payload: &[u8]) -> Self {
        let mut buffer = vec![0u8; reserve + payload.len()];
        buffer[reserve..].copy_from_slice(payload);
        Self {
            buffer,
            start: reserve,
            payload: reserve,
            link_header: None,
            network_header: None,
            transport_header: None,
            pkt_type: PacketType::Host,
        }
    }

    /// Total packet size (all parsed headers plus remaining payload)
    pub fn size(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// The whole packet, headers included
    pub fn full(&self) -> &[u8] {
        &self.buffer[self.start..]
    }

    /// Unconsumed payload (after any parsed headers)
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.payload..]
    }

    /// Available headroom in front of the packet
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Prepend bytes into the headroom, recording them as the link header.
    ///
    /// Returns false if the headroom is too small.
    pub fn prepend_link_header(&mut self, header: &[u8]) -> bool {
        if header.len() > self.start {
            return false;
        }
        let new_start = self.start - header.len();
        self.buffer[new_start..self.start].copy_from_slice(header);
        self.link_header = Some((new_start, self.start));
        self.start = new_start;
        true
    }

    /// Consume `n` bytes off the payload as the network header.
    ///
    /// Returns false if the payload is too short.
    pub fn consume_network_header(&mut self, n: usize) -> bool {
        if self.buffer.len() - self.payload < n {
            return false;
        }
        self.network_header = Some((self.payload, self.payload + n));
        self.payload += n;
        true
    }

    /// Consume `n` bytes off the payload as the transport header.
    ///
    /// Returns false if the payload is too short.
    pub fn consume_transport_header(&mut self, n: usize) -> bool {
        if self.buffer.len() - self.payload < n {
            return false;
        }
        self.transport_header = Some((self.payload, self.payload + n));
        self.payload += n;
        true
    }

    pub fn link_header(&self) -> &[u8] {
        match self.link_header {
            Some((a, b)) => &self.buffer[a..b],
            None => &[],
        }
    }

    pub fn network_header(&self) -> &[u8] {
        match self.network_header {
            Some((a, b)) => &self.buffer[a..b],
            None => &[],
        }
    }

    pub fn transport_header(&self) -> &[u8] {
        match self.transport_header {
            Some((a, b)) => &self.buffer[a..b],
            None => &[],
        }
    }

    pub fn has_transport_header(&self) -> bool {
        self.transport_header.is_some()
    }
}
