//! Interface layer of the stack
//!
//! `Nic` binds a link endpoint to the configured network protocols and
//! owns everything per-interface: address tables, the NDP state machine,
//! packet-socket fan-out, and the receive/forward paths. Collaborating
//! engines (protocols, link drivers, transport demux) plug in through the
//! traits in `endpoints`.

pub mod address_table;
pub mod context;
pub mod endpoints;
pub mod ndp;
pub mod neighbor_cache;
pub mod nic;
pub mod packet;
pub mod referenced;
pub mod route;

pub use address_table::{
    AddAddressOptions, AddressConfigType, AddressEntry, AddressKind, AddressTable,
    PrimaryEndpointBehavior,
};
pub use context::{
    AcceptAllTables, Clock, ForwardingQueue, IpTables, RouteLookup, StackContext, TimerHandle,
    TokioClock, TransportProtocolState,
};
pub use endpoints::{
    ControlType, GroupAddressableEndpoint, LinkAddressResolver, LinkCapabilities, LinkEndpoint,
    NetworkDispatcher, NetworkEndpoint, NetworkProtocol, PacketEndpoint, TransportDemux,
    TransportEndpointId, TransportProtocol,
};
pub use ndp::NdpDispatcher;
pub use neighbor_cache::{LinkAddrCache, NeighborCache, NeighborEntry, NeighborEntryState};
pub use nic::{Nic, NicContext, NicId, ProtocolAddress};
pub use packet::{PacketBuffer, PacketType};
pub use referenced::ReferencedEndpoint;
pub use route::{Resolution, Route};
