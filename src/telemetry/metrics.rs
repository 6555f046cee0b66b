//! Packet statistics.
//!
//! Thread-safe counters tracked per interface and stack-wide. Counters are
//! plain relaxed atomics; they are incremented on the hot path without any
//! lock held.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Packet and byte counts for one traffic direction.
#[derive(Debug, Default)]
pub struct DirectionStats {
    pub packets: Counter,
    pub bytes: Counter,
}

impl DirectionStats {
    /// Records one packet of the given size.
    pub fn record(&self, bytes: usize) {
        self.packets.inc();
        self.bytes.add(bytes as u64);
    }
}

/// Per-interface statistics.
#[derive(Debug, Default)]
pub struct NicStats {
    /// Traffic received and accepted by the interface.
    pub rx: DirectionStats,
    /// Traffic transmitted by the interface.
    pub tx: DirectionStats,
    /// Traffic received while the interface was disabled.
    pub disabled_rx: DirectionStats,
}

impl NicStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// IP-layer statistics shared by every interface of a stack.
#[derive(Debug, Default)]
pub struct IpStats {
    /// IPv4/IPv6 packets received.
    pub packets_received: Counter,
    /// Received packets whose source address belongs to this host.
    pub invalid_source_addresses_received: Counter,
    /// Received packets with no local endpoint and no usable route.
    pub invalid_destination_addresses_received: Counter,
    /// Packets that failed transmission on the outgoing link.
    pub outgoing_packet_errors: Counter,
}

/// Stack-wide statistics.
#[derive(Debug, Default)]
pub struct StackStats {
    /// Packets received for a network or transport protocol with no engine.
    pub unknown_protocol_rcvd_packets: Counter,
    /// Packets dropped because a header could not be parsed.
    pub malformed_rcvd_packets: Counter,
    pub ip: IpStats,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports all counters as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            (
                "unknown_protocol_rcvd_packets".into(),
                self.unknown_protocol_rcvd_packets.get(),
            ),
            (
                "malformed_rcvd_packets".into(),
                self.malformed_rcvd_packets.get(),
            ),
            ("ip_packets_received".into(), self.ip.packets_received.get()),
            (
                "ip_invalid_source_addresses_received".into(),
                self.ip.invalid_source_addresses_received.get(),
            ),
            (
                "ip_invalid_destination_addresses_received".into(),
                self.ip.invalid_destination_addresses_received.get(),
            ),
            (
                "ip_outgoing_packet_errors".into(),
                self.ip.outgoing_packet_errors.get(),
            ),
        ]
    }
}
