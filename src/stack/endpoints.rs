//! Collaborator interfaces of the interface layer.
//!
//! Link drivers, network protocol engines, transport demultiplexers and
//! packet-socket observers live outside this crate. These traits define the
//! seams the `Nic` drives them through.

use crate::protocol::{AddressWithPrefix, LinkAddr, NetworkProtocolId, TransportProtocolId};
use crate::stack::address_table::{AddAddressOptions, AddressEntry, PrimaryEndpointBehavior};
use crate::stack::context::StackContext;
use crate::stack::neighbor_cache::NeighborCache;
use crate::stack::nic::{Nic, NicId};
use crate::stack::packet::PacketBuffer;
use crate::stack::route::Route;
use crate::Result;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

/// Properties a link endpoint advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCapabilities {
    /// The link loops frames back to this host
    pub loopback: bool,
    /// Network addresses must be resolved to link addresses before sending
    pub resolution_required: bool,
}

/// Receiver of inbound and locally-originated frames, implemented by the NIC.
pub trait NetworkDispatcher: Send + Sync {
    /// Hand a received frame's payload to the network layer.
    fn deliver_network_packet(
        &self,
        remote: Option<LinkAddr>,
        local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    );

    /// Observe a frame about to leave through this interface.
    fn deliver_outbound_packet(
        &self,
        remote: Option<LinkAddr>,
        local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    );
}

/// A link-layer device (Ethernet, tun/tap, loopback, ...)
pub trait LinkEndpoint: Send + Sync {
    fn capabilities(&self) -> LinkCapabilities;

    /// Maximum link-layer header size, reserved as headroom on egress
    fn max_header_length(&self) -> usize;

    fn link_address(&self) -> LinkAddr;

    fn mtu(&self) -> u32;

    /// Register (or, with None, clear) the dispatcher receiving inbound
    /// frames. The endpoint calls the dispatcher serially.
    fn attach(&self, dispatcher: Option<Weak<dyn NetworkDispatcher>>);

    fn write_packet(
        &self,
        route: &Route,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    ) -> Result<()>;

    /// Synthesize the link-layer header in front of `pkt`, as it would be
    /// built on transmission.
    fn add_header(
        &self,
        local: Option<LinkAddr>,
        remote: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: &mut PacketBuffer,
    );
}

/// A network-layer protocol engine (IPv4, IPv6, ARP, ...)
pub trait NetworkProtocol: Send + Sync {
    fn number(&self) -> NetworkProtocolId;

    /// Instantiate this protocol's endpoint on an interface. `neigh` is the
    /// interface's neighbor cache, absent when the link needs no resolution.
    fn new_endpoint(
        &self,
        nic: Weak<Nic>,
        neigh: Option<Arc<NeighborCache>>,
        link: Arc<dyn LinkEndpoint>,
        ctx: Arc<StackContext>,
    ) -> Arc<dyn NetworkEndpoint>;

    /// Parse the network header off `pkt`. Returns the transport protocol
    /// and whether a transport header follows, or None if the packet is too
    /// small to contain a network header.
    fn parse(&self, pkt: &mut PacketBuffer) -> Option<(TransportProtocolId, bool)>;

    /// Extract (source, destination) from a parsed network header.
    fn parse_addresses(&self, header: &[u8]) -> (IpAddr, IpAddr);
}

/// A network protocol's per-interface instance.
pub trait NetworkEndpoint: Send + Sync {
    fn enable(&self) -> Result<()>;
    fn disable(&self) -> Result<()>;

    /// Release all resources. The endpoint is never used again afterwards.
    fn close(&self);

    fn add_address(
        &self,
        addr: AddressWithPrefix,
        opts: AddAddressOptions,
    ) -> Result<Arc<AddressEntry>>;
    fn remove_address(&self, addr: IpAddr) -> Result<()>;
    fn remove_all_addresses(&self) -> Result<()>;

    /// True if `addr` is a permanent (possibly tentative) address here.
    fn has_address(&self, addr: IpAddr) -> bool;

    fn get_endpoint(&self, addr: IpAddr) -> Option<Arc<AddressEntry>>;
    fn get_assigned_endpoint(
        &self,
        addr: IpAddr,
        is_loopback: bool,
        allow_temp: bool,
        peb: PrimaryEndpointBehavior,
    ) -> Option<Arc<AddressEntry>>;
    fn primary_endpoint(&self, remote: Option<IpAddr>, spoofing: bool)
        -> Option<Arc<AddressEntry>>;
    fn all_endpoints(&self) -> Vec<Arc<AddressEntry>>;
    fn all_addresses(&self) -> Vec<AddressWithPrefix>;
    fn primary_addresses(&self) -> Vec<AddressWithPrefix>;

    /// Handle a packet whose destination resolved to this endpoint.
    fn handle_packet(&self, route: &Route, pkt: PacketBuffer);

    /// Capability probe for multicast group membership.
    fn as_group(&self) -> Option<&dyn GroupAddressableEndpoint> {
        None
    }
}

/// Optional multicast-membership capability of a network endpoint.
///
/// Join counts are maintained by the endpoint; the interface only
/// orchestrates.
pub trait GroupAddressableEndpoint: Send + Sync {
    /// Returns true if the group was newly joined.
    fn join_group(&self, addr: IpAddr) -> Result<bool>;

    /// Returns true if the group membership was removed. With `force`, the
    /// join count is ignored and the membership is dropped outright.
    fn leave_group(&self, addr: IpAddr, force: bool) -> Result<bool>;

    fn leave_all_groups(&self) -> Result<()>;

    fn is_in_group(&self, addr: IpAddr) -> bool;
}

/// A packet socket observing raw frames on an interface.
pub trait PacketEndpoint: Send + Sync {
    fn handle_packet(
        &self,
        nic_id: NicId,
        local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    );
}

/// 4-tuple identifying a transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportEndpointId {
    pub local_port: u16,
    pub local_address: IpAddr,
    pub remote_port: u16,
    pub remote_address: IpAddr,
}

/// Kind of control (error) message delivered to a transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    PacketTooBig,
    PortUnreachable,
    NetworkUnreachable,
}

/// A transport-layer protocol engine (TCP, UDP, ICMP, ...)
pub trait TransportProtocol: Send + Sync {
    fn number(&self) -> TransportProtocolId;

    /// Smallest valid header for this protocol
    fn minimum_packet_size(&self) -> usize;

    /// Extract (source port, destination port) from a transport header.
    fn parse_ports(&self, header: &[u8]) -> Result<(u16, u16)>;

    /// Parse the transport header off `pkt`. Returns false on failure.
    fn parse(&self, pkt: &mut PacketBuffer) -> bool;

    /// Last-resort handler for packets no endpoint claimed (e.g. to send a
    /// port-unreachable error). Returns true if the packet was consumed.
    fn handle_unknown_destination_packet(
        &self,
        route: &Route,
        id: &TransportEndpointId,
        pkt: &mut PacketBuffer,
    ) -> bool;
}

/// Handler invoked for a transport protocol before the demultiplexer gives
/// up on a packet.
pub type TransportDefaultHandler =
    Box<dyn Fn(&Route, &TransportEndpointId, &mut PacketBuffer) -> bool + Send + Sync>;

/// The stack's transport demultiplexer.
pub trait TransportDemux: Send + Sync {
    /// Deliver to raw sockets registered for `protocol`. Always called
    /// before any validation of the transport header.
    fn deliver_raw_packet(&self, route: &Route, protocol: TransportProtocolId, pkt: &PacketBuffer);

    /// Deliver to the endpoint registered for `id`. Returns true if an
    /// endpoint consumed the packet.
    fn deliver_packet(
        &self,
        route: &Route,
        protocol: TransportProtocolId,
        pkt: &mut PacketBuffer,
        id: &TransportEndpointId,
    ) -> bool;

    /// Deliver a control message to the endpoint registered for `id`.
    fn deliver_control_packet(
        &self,
        net: NetworkProtocolId,
        trans: TransportProtocolId,
        typ: ControlType,
        extra: u32,
        pkt: &PacketBuffer,
        id: &TransportEndpointId,
    ) -> bool;
}

/// Resolver of network addresses to link addresses (ARP, NDP).
pub trait LinkAddressResolver: Send + Sync {
    /// The network protocol this resolver serves
    fn link_address_protocol(&self) -> NetworkProtocolId;

    /// Resolve addresses with a fixed mapping (broadcast, multicast)
    /// without consulting the network.
    fn resolve_static_address(&self, addr: IpAddr) -> Option<LinkAddr>;

    /// Send a resolution request for `addr` out of `link`.
    fn link_address_request(
        &self,
        addr: IpAddr,
        local_addr: Option<IpAddr>,
        link: &dyn LinkEndpoint,
    ) -> Result<()>;
}
