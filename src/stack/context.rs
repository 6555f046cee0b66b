//! Stack context
//!
//! Everything the owning stack provides to its interfaces: protocol
//! registries, the clock driving ND timers, the iptables hook, the
//! forwarding queue for packets awaiting link-address resolution, the
//! transport demultiplexer and global statistics.

use crate::config::{NdpConfigurations, NudConfigurations};
use crate::protocol::{LinkAddr, NetworkProtocolId, TransportProtocolId};
use crate::stack::endpoints::{
    LinkAddressResolver, NetworkProtocol, TransportDefaultHandler, TransportDemux,
    TransportProtocol,
};
use crate::stack::ndp::NdpDispatcher;
use crate::stack::neighbor_cache::LinkAddrCache;
use crate::stack::nic::Nic;
use crate::stack::packet::PacketBuffer;
use crate::stack::route::Route;
use crate::telemetry::StackStats;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// Handle to a scheduled callback. Cancelling prevents a pending callback
/// from running; an already-running callback is unaffected.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancelled: cancelled.clone(),
            },
            cancelled,
        )
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Time source and timer scheduler.
///
/// Callbacks are posted to a separate worker and re-enter the interface
/// through its lock; the scheduler never invokes them with a lock held.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn schedule(&self, delay: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Clock backed by the tokio timer wheel.
pub struct TokioClock {
    handle: tokio::runtime::Handle,
}

impl TokioClock {
    /// Uses the current tokio runtime. Panics outside of one, like any
    /// `Handle::current` caller.
    pub fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let (timer, cancelled) = TimerHandle::new();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !cancelled.load(Ordering::Acquire) {
                f();
            }
        });
        timer
    }
}

/// The stack's packet filter, consulted on the IPv4 receive path.
pub trait IpTables: Send + Sync {
    /// Prerouting hook. Returns false to drop the packet.
    fn check_prerouting(
        &self,
        pkt: &mut PacketBuffer,
        nic_address: Option<IpAddr>,
        nic_name: &str,
    ) -> bool;
}

/// Filter that accepts everything.
pub struct AcceptAllTables;

impl IpTables for AcceptAllTables {
    fn check_prerouting(&self, _: &mut PacketBuffer, _: Option<IpAddr>, _: &str) -> bool {
        true
    }
}

/// Queue of packets whose next-hop link address is still resolving.
///
/// The route is handed over together with the resolution channel; the
/// queue owns both from then on. When the channel yields an address the
/// queue emits the packet through the interface; on failure it drops the
/// packet and counts it.
pub trait ForwardingQueue: Send + Sync {
    fn enqueue(
        &self,
        resolution: mpsc::Receiver<Option<LinkAddr>>,
        nic: Arc<Nic>,
        route: Route,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    );
}

/// Queue that silently drops everything (stand-in when forwarding is off).
pub struct NullForwardingQueue;

impl ForwardingQueue for NullForwardingQueue {
    fn enqueue(
        &self,
        _: mpsc::Receiver<Option<LinkAddr>>,
        _: Arc<Nic>,
        _: Route,
        _: NetworkProtocolId,
        _: PacketBuffer,
    ) {
    }
}

/// The stack's routing table lookup.
pub trait RouteLookup: Send + Sync {
    fn find_route(&self, dst: IpAddr, protocol: NetworkProtocolId) -> Result<Route>;
}

/// Lookup with no routes.
pub struct EmptyRouteTable;

impl RouteLookup for EmptyRouteTable {
    fn find_route(&self, dst: IpAddr, _: NetworkProtocolId) -> Result<Route> {
        Err(Error::NoRoute(dst))
    }
}

/// Demultiplexer with no registered endpoints.
pub struct NullDemux;

impl TransportDemux for NullDemux {
    fn deliver_raw_packet(
        &self,
        _: &Route,
        _: TransportProtocolId,
        _: &PacketBuffer,
    ) {
    }

    fn deliver_packet(
        &self,
        _: &Route,
        _: TransportProtocolId,
        _: &mut PacketBuffer,
        _: &crate::stack::endpoints::TransportEndpointId,
    ) -> bool {
        false
    }

    fn deliver_control_packet(
        &self,
        _: NetworkProtocolId,
        _: TransportProtocolId,
        _: crate::stack::endpoints::ControlType,
        _: u32,
        _: &PacketBuffer,
        _: &crate::stack::endpoints::TransportEndpointId,
    ) -> bool {
        false
    }
}

/// A registered transport protocol and its per-stack default handler.
pub struct TransportProtocolState {
    pub proto: Arc<dyn TransportProtocol>,
    pub default_handler: Option<TransportDefaultHandler>,
}

/// Stack-level environment shared by every interface.
///
/// Registries are populated before any interface is created and are
/// immutable afterwards; mode flags that may change at runtime are atomic.
pub struct StackContext {
    clock: Arc<dyn Clock>,
    pub stats: StackStats,
    iptables: Arc<dyn IpTables>,
    forwarder: Arc<dyn ForwardingQueue>,
    demux: Arc<dyn TransportDemux>,
    routes: Arc<dyn RouteLookup>,
    ndp_dispatcher: Option<Arc<dyn NdpDispatcher>>,
    link_addr_cache: Arc<LinkAddrCache>,

    pub ndp_configs: NdpConfigurations,
    pub nud_configs: NudConfigurations,

    /// Drop packets whose source address is local to the receiving
    /// interface (spoof protection for physical links).
    pub handle_local: bool,
    /// Auto-generate an IPv6 link-local address when an interface with an
    /// IPv6 endpoint is enabled.
    pub auto_gen_ipv6_link_local: bool,
    /// Give interfaces a neighbor cache when their link requires
    /// resolution.
    pub use_neighbor_cache: bool,
    /// Secret mixed into opaque interface identifiers for SLAAC.
    pub opaque_iid_secret: [u8; 32],

    forwarding: AtomicBool,

    network_protocols: HashMap<NetworkProtocolId, Arc<dyn NetworkProtocol>>,
    transport_protocols: HashMap<TransportProtocolId, TransportProtocolState>,
    link_addr_resolvers: HashMap<NetworkProtocolId, Arc<dyn LinkAddressResolver>>,
}

impl StackContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            stats: StackStats::new(),
            iptables: Arc::new(AcceptAllTables),
            forwarder: Arc::new(NullForwardingQueue),
            demux: Arc::new(NullDemux),
            routes: Arc::new(EmptyRouteTable),
            ndp_dispatcher: None,
            link_addr_cache: LinkAddrCache::new(),
            ndp_configs: NdpConfigurations::default(),
            nud_configs: NudConfigurations::default(),
            handle_local: false,
            auto_gen_ipv6_link_local: false,
            use_neighbor_cache: false,
            opaque_iid_secret: [0; 32],
            forwarding: AtomicBool::new(false),
            network_protocols: HashMap::new(),
            transport_protocols: HashMap::new(),
            link_addr_resolvers: HashMap::new(),
        }
    }

    pub fn add_network_protocol(&mut self, proto: Arc<dyn NetworkProtocol>) {
        self.network_protocols.insert(proto.number(), proto);
    }

    pub fn add_transport_protocol(
        &mut self,
        proto: Arc<dyn TransportProtocol>,
        default_handler: Option<TransportDefaultHandler>,
    ) {
        self.transport_protocols.insert(
            proto.number(),
            TransportProtocolState {
                proto,
                default_handler,
            },
        );
    }

    pub fn add_link_addr_resolver(&mut self, resolver: Arc<dyn LinkAddressResolver>) {
        self.link_addr_resolvers
            .insert(resolver.link_address_protocol(), resolver);
    }

    pub fn set_iptables(&mut self, iptables: Arc<dyn IpTables>) {
        self.iptables = iptables;
    }

    pub fn set_forwarder(&mut self, forwarder: Arc<dyn ForwardingQueue>) {
        self.forwarder = forwarder;
    }

    pub fn set_demux(&mut self, demux: Arc<dyn TransportDemux>) {
        self.demux = demux;
    }

    pub fn set_route_lookup(&mut self, routes: Arc<dyn RouteLookup>) {
        self.routes = routes;
    }

    pub fn set_ndp_dispatcher(&mut self, dispatcher: Arc<dyn NdpDispatcher>) {
        self.ndp_dispatcher = Some(dispatcher);
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn iptables(&self) -> &Arc<dyn IpTables> {
        &self.iptables
    }

    pub fn forwarder(&self) -> &Arc<dyn ForwardingQueue> {
        &self.forwarder
    }

    pub fn demux(&self) -> &Arc<dyn TransportDemux> {
        &self.demux
    }

    pub fn ndp_dispatcher(&self) -> Option<&Arc<dyn NdpDispatcher>> {
        self.ndp_dispatcher.as_ref()
    }

    pub fn link_addr_cache(&self) -> &Arc<LinkAddrCache> {
        &self.link_addr_cache
    }

    pub fn find_route(&self, dst: IpAddr, protocol: NetworkProtocolId) -> Result<Route> {
        self.routes.find_route(dst, protocol)
    }

    /// Whether the stack forwards packets between interfaces (router mode).
    pub fn forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    pub fn set_forwarding(&self, forwarding: bool) {
        self.forwarding.store(forwarding, Ordering::Release);
    }

    pub fn network_protocol(&self, num: NetworkProtocolId) -> Option<&Arc<dyn NetworkProtocol>> {
        self.network_protocols.get(&num)
    }

    pub fn network_protocols(
        &self,
    ) -> impl Iterator<Item = (&NetworkProtocolId, &Arc<dyn NetworkProtocol>)> {
        self.network_protocols.iter()
    }

    pub fn transport_protocol(&self, num: TransportProtocolId) -> Option<&TransportProtocolState> {
        self.transport_protocols.get(&num)
    }

    pub fn link_addr_resolver(
        &self,
        num: NetworkProtocolId,
    ) -> Option<&Arc<dyn LinkAddressResolver>> {
        self.link_addr_resolvers.get(&num)
    }

    pub fn has_link_addr_resolvers(&self) -> bool {
        !self.link_addr_resolvers.is_empty()
    }
}
