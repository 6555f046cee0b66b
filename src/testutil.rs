//! Shared stubs for unit tests: a manually-driven clock, a recording link
//! endpoint, table-backed network protocol stubs and recording observers.

use crate::protocol::{
    AddressWithPrefix, LinkAddr, NetworkProtocolId, Subnet, TransportProtocolId, IPV4_PROTOCOL,
    IPV6_PROTOCOL,
};
use crate::stack::address_table::{
    AddAddressOptions, AddressEntry, AddressTable, PrimaryEndpointBehavior,
};
use crate::stack::context::{Clock, ForwardingQueue, IpTables, RouteLookup, StackContext, TimerHandle};
use crate::stack::endpoints::{
    ControlType, GroupAddressableEndpoint, LinkAddressResolver, LinkCapabilities, LinkEndpoint,
    NetworkDispatcher, NetworkEndpoint, NetworkProtocol, PacketEndpoint, TransportDemux,
    TransportEndpointId, TransportProtocol,
};
use crate::stack::ndp::NdpDispatcher;
use crate::stack::neighbor_cache::NeighborCache;
use crate::stack::nic::{Nic, NicId};
use crate::stack::packet::{PacketBuffer, PacketType};
use crate::stack::route::Route;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Clock

struct ScheduledTimer {
    deadline: Duration,
    cancelled: Arc<AtomicBool>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

struct ManualClockInner {
    offset: Duration,
    timers: Vec<ScheduledTimer>,
}

/// Deterministic clock: time only moves when `advance` is called, firing
/// due timers in deadline order outside any lock.
pub(crate) struct ManualClock {
    base: Instant,
    inner: Mutex<ManualClockInner>,
}

impl ManualClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            inner: Mutex::new(ManualClockInner {
                offset: Duration::ZERO,
                timers: Vec::new(),
            }),
        })
    }

    pub(crate) fn advance(&self, d: Duration) {
        let target = self.inner.lock().unwrap().offset + d;
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                let due = inner
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| {
                        !t.cancelled.load(Ordering::Acquire) && t.deadline <= target
                    })
                    .min_by_key(|(_, t)| t.deadline)
                    .map(|(i, _)| i);
                match due {
                    Some(i) => {
                        let mut timer = inner.timers.remove(i);
                        inner.offset = inner.offset.max(timer.deadline);
                        timer.callback.take()
                    }
                    None => break,
                }
            };
            if let Some(callback) = next {
                callback();
            }
        }
        let mut inner = self.inner.lock().unwrap();
        inner.offset = inner.offset.max(target);
        inner
            .timers
            .retain(|t| !t.cancelled.load(Ordering::Acquire));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.inner.lock().unwrap().offset
    }

    fn schedule(&self, delay: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let (handle, cancelled) = TimerHandle::new();
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.offset + delay;
        inner.timers.push(ScheduledTimer {
            deadline,
            cancelled,
            callback: Some(f),
        });
        handle
    }
}

// ---------------------------------------------------------------------------
// Link endpoint

#[derive(Debug, Clone)]
pub(crate) struct WrittenPacket {
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub remote_link_address: Option<LinkAddr>,
    pub protocol: NetworkProtocolId,
    pub bytes: Vec<u8>,
}

pub(crate) struct StubLinkEndpoint {
    caps: LinkCapabilities,
    link_addr: LinkAddr,
    writes: Mutex<Vec<WrittenPacket>>,
    dispatcher: Mutex<Option<Weak<dyn NetworkDispatcher>>>,
    fail_writes: AtomicBool,
}

impl StubLinkEndpoint {
    pub(crate) fn ethernet(link_addr: LinkAddr) -> Arc<Self> {
        Arc::new(Self {
            caps: LinkCapabilities {
                loopback: false,
                resolution_required: true,
            },
            link_addr,
            writes: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub(crate) fn loopback() -> Arc<Self> {
        Arc::new(Self {
            caps: LinkCapabilities {
                loopback: true,
                resolution_required: false,
            },
            link_addr: LinkAddr::ZERO,
            writes: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub(crate) fn written(&self) -> Vec<WrittenPacket> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn clear_written(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub(crate) fn attached(&self) -> bool {
        self.dispatcher.lock().unwrap().is_some()
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Push a frame up into the attached dispatcher, as the link would.
    pub(crate) fn inject(
        &self,
        remote: Option<LinkAddr>,
        local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        bytes: Vec<u8>,
    ) {
        let dispatcher = self.dispatcher.lock().unwrap().clone();
        if let Some(dispatcher) = dispatcher.and_then(|w| w.upgrade()) {
            dispatcher.deliver_network_packet(remote, local, protocol, PacketBuffer::new(bytes));
        }
    }
}

impl LinkEndpoint for StubLinkEndpoint {
    fn capabilities(&self) -> LinkCapabilities {
        self.caps
    }

    fn max_header_length(&self) -> usize {
        14
    }

    fn link_address(&self) -> LinkAddr {
        self.link_addr
    }

    fn mtu(&self) -> u32 {
        1500
    }

    fn attach(&self, dispatcher: Option<Weak<dyn NetworkDispatcher>>) {
        *self.dispatcher.lock().unwrap() = dispatcher;
    }

    fn write_packet(
        &self,
        route: &Route,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("link down")));
        }
        self.writes.lock().unwrap().push(WrittenPacket {
            local_address: route.local_address,
            remote_address: route.remote_address,
            remote_link_address: route.remote_link_address,
            protocol,
            bytes: pkt.full().to_vec(),
        });
        Ok(())
    }

    fn add_header(
        &self,
        local: Option<LinkAddr>,
        remote: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: &mut PacketBuffer,
    ) {
        let mut header = [0u8; 14];
        header[..6].copy_from_slice(&remote.unwrap_or(LinkAddr::BROADCAST).0);
        header[6..12].copy_from_slice(&local.unwrap_or(self.link_addr).0);
        header[12..].copy_from_slice(&protocol.to_be_bytes());
        pkt.prepend_link_header(&header);
    }
}

// ---------------------------------------------------------------------------
// Network protocol / endpoint

#[derive(Debug, Clone)]
pub(crate) struct DeliveredPacket {
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub remote_link_address: Option<LinkAddr>,
    pub data: Vec<u8>,
}

/// Minimal network protocol whose header is `[src][dst][transport]` with
/// fixed-size addresses.
pub(crate) struct StubNetworkProtocol {
    number: NetworkProtocolId,
    addr_len: usize,
    endpoints: Mutex<Vec<Arc<StubNetworkEndpoint>>>,
}

impl StubNetworkProtocol {
    pub(crate) fn v4() -> Arc<Self> {
        Arc::new(Self {
            number: IPV4_PROTOCOL,
            addr_len: 4,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn v6() -> Arc<Self> {
        Arc::new(Self {
            number: IPV6_PROTOCOL,
            addr_len: 16,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    fn header_len(&self) -> usize {
        self.addr_len * 2 + 1
    }

    /// Endpoints created so far, in creation order (one per interface).
    pub(crate) fn endpoints(&self) -> Vec<Arc<StubNetworkEndpoint>> {
        self.endpoints.lock().unwrap().clone()
    }

    pub(crate) fn endpoint(&self, i: usize) -> Arc<StubNetworkEndpoint> {
        self.endpoints.lock().unwrap()[i].clone()
    }
}

impl NetworkProtocol for StubNetworkProtocol {
    fn number(&self) -> NetworkProtocolId {
        self.number
    }

    fn new_endpoint(
        &self,
        nic: Weak<Nic>,
        neigh: Option<Arc<NeighborCache>>,
        _link: Arc<dyn LinkEndpoint>,
        _ctx: Arc<StackContext>,
    ) -> Arc<dyn NetworkEndpoint> {
        let ep = Arc::new(StubNetworkEndpoint {
            _nic: nic,
            neigh,
            table: AddressTable::new(),
            enabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            delivered: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
        });
        self.endpoints.lock().unwrap().push(ep.clone());
        ep
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> Option<(TransportProtocolId, bool)> {
        let header_len = self.header_len();
        if !pkt.consume_network_header(header_len) {
            return None;
        }
        let transport = pkt.network_header()[header_len - 1];
        Some((transport, transport != 0))
    }

    fn parse_addresses(&self, header: &[u8]) -> (IpAddr, IpAddr) {
        match self.addr_len {
            4 => {
                let mut src = [0u8; 4];
                let mut dst = [0u8; 4];
                src.copy_from_slice(&header[..4]);
                dst.copy_from_slice(&header[4..8]);
                (
                    IpAddr::V4(Ipv4Addr::from(src)),
                    IpAddr::V4(Ipv4Addr::from(dst)),
                )
            }
            _ => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&header[..16]);
                dst.copy_from_slice(&header[16..32]);
                (
                    IpAddr::V6(Ipv6Addr::from(src)),
                    IpAddr::V6(Ipv6Addr::from(dst)),
                )
            }
        }
    }
}

pub(crate) struct StubNetworkEndpoint {
    _nic: Weak<Nic>,
    #[allow(dead_code)]
    neigh: Option<Arc<NeighborCache>>,
    table: Arc<AddressTable>,
    enabled: AtomicBool,
    closed: AtomicBool,
    delivered: Mutex<Vec<DeliveredPacket>>,
    groups: Mutex<HashMap<IpAddr, usize>>,
}

impl StubNetworkEndpoint {
    pub(crate) fn delivered(&self) -> Vec<DeliveredPacket> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn group_count(&self, addr: IpAddr) -> usize {
        self.groups.lock().unwrap().get(&addr).copied().unwrap_or(0)
    }
}

impl NetworkEndpoint for StubNetworkEndpoint {
    fn enable(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn add_address(
        &self,
        addr: AddressWithPrefix,
        opts: AddAddressOptions,
    ) -> Result<Arc<AddressEntry>> {
        self.table.add(addr, opts)
    }

    fn remove_address(&self, addr: IpAddr) -> Result<()> {
        self.table.remove(addr)
    }

    fn remove_all_addresses(&self) -> Result<()> {
        self.table.remove_all();
        Ok(())
    }

    fn has_address(&self, addr: IpAddr) -> bool {
        self.table.has(addr)
    }

    fn get_endpoint(&self, addr: IpAddr) -> Option<Arc<AddressEntry>> {
        self.table.get(addr)
    }

    fn get_assigned_endpoint(
        &self,
        addr: IpAddr,
        is_loopback: bool,
        allow_temp: bool,
        peb: PrimaryEndpointBehavior,
    ) -> Option<Arc<AddressEntry>> {
        self.table.get_assigned(addr, is_loopback, allow_temp, peb)
    }

    fn primary_endpoint(
        &self,
        remote: Option<IpAddr>,
        spoofing: bool,
    ) -> Option<Arc<AddressEntry>> {
        self.table.primary_endpoint(remote, spoofing)
    }

    fn all_endpoints(&self) -> Vec<Arc<AddressEntry>> {
        self.table.all_endpoints()
    }

    fn all_addresses(&self) -> Vec<AddressWithPrefix> {
        self.table.all_addresses()
    }

    fn primary_addresses(&self) -> Vec<AddressWithPrefix> {
        self.table.primary_addresses()
    }

    fn handle_packet(&self, route: &Route, pkt: PacketBuffer) {
        self.delivered.lock().unwrap().push(DeliveredPacket {
            local_address: route.local_address,
            remote_address: route.remote_address,
            remote_link_address: route.remote_link_address,
            data: pkt.full().to_vec(),
        });
    }

    fn as_group(&self) -> Option<&dyn GroupAddressableEndpoint> {
        Some(self)
    }
}

impl GroupAddressableEndpoint for StubNetworkEndpoint {
    fn join_group(&self, addr: IpAddr) -> Result<bool> {
        let mut groups = self.groups.lock().unwrap();
        let count = groups.entry(addr).or_insert(0);
        *count += 1;
        Ok(*count == 1)
    }

    fn leave_group(&self, addr: IpAddr, force: bool) -> Result<bool> {
        let mut groups = self.groups.lock().unwrap();
        let Some(count) = groups.get_mut(&addr) else {
            return Err(Error::BadLocalAddress(addr));
        };
        if force || *count == 1 {
            groups.remove(&addr);
            return Ok(true);
        }
        *count -= 1;
        Ok(false)
    }

    fn leave_all_groups(&self) -> Result<()> {
        self.groups.lock().unwrap().clear();
        Ok(())
    }

    fn is_in_group(&self, addr: IpAddr) -> bool {
        self.groups.lock().unwrap().contains_key(&addr)
    }
}

// ---------------------------------------------------------------------------
// Resolver

pub(crate) struct StubResolver {
    protocol: NetworkProtocolId,
    requests: Mutex<Vec<IpAddr>>,
}

impl StubResolver {
    pub(crate) fn new(protocol: NetworkProtocolId) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<IpAddr> {
        self.requests.lock().unwrap().clone()
    }
}

impl LinkAddressResolver for StubResolver {
    fn link_address_protocol(&self) -> NetworkProtocolId {
        self.protocol
    }

    fn resolve_static_address(&self, addr: IpAddr) -> Option<LinkAddr> {
        LinkAddr::for_remote_multicast(addr)
    }

    fn link_address_request(
        &self,
        addr: IpAddr,
        _local_addr: Option<IpAddr>,
        _link: &dyn LinkEndpoint,
    ) -> Result<()> {
        self.requests.lock().unwrap().push(addr);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observers

#[derive(Debug, Clone)]
pub(crate) struct ReceivedFrame {
    pub nic: NicId,
    pub protocol: NetworkProtocolId,
    pub pkt_type: PacketType,
    pub link_header: Vec<u8>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct RecordingPacketEndpoint {
    received: Mutex<Vec<ReceivedFrame>>,
}

impl RecordingPacketEndpoint {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn received(&self) -> Vec<ReceivedFrame> {
        self.received.lock().unwrap().clone()
    }
}

impl PacketEndpoint for RecordingPacketEndpoint {
    fn handle_packet(
        &self,
        nic: NicId,
        _local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    ) {
        self.received.lock().unwrap().push(ReceivedFrame {
            nic,
            protocol,
            pkt_type: pkt.pkt_type,
            link_header: pkt.link_header().to_vec(),
            bytes: pkt.full().to_vec(),
        });
    }
}

pub(crate) struct EnqueuedForward {
    pub nic: Arc<Nic>,
    pub protocol: NetworkProtocolId,
    pub route: Route,
    pub resolution: mpsc::Receiver<Option<LinkAddr>>,
    pub pkt: PacketBuffer,
}

#[derive(Default)]
pub(crate) struct RecordingForwarder {
    enqueued: Mutex<Vec<EnqueuedForward>>,
}

impl RecordingForwarder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn len(&self) -> usize {
        self.enqueued.lock().unwrap().len()
    }

    pub(crate) fn take(&self) -> Vec<EnqueuedForward> {
        std::mem::take(&mut self.enqueued.lock().unwrap())
    }
}

impl ForwardingQueue for RecordingForwarder {
    fn enqueue(
        &self,
        resolution: mpsc::Receiver<Option<LinkAddr>>,
        nic: Arc<Nic>,
        route: Route,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    ) {
        self.enqueued.lock().unwrap().push(EnqueuedForward {
            nic,
            protocol,
            route,
            resolution,
            pkt,
        });
    }
}

#[derive(Default)]
pub(crate) struct RecordingDemux {
    pub raw: Mutex<Vec<TransportProtocolId>>,
    pub delivered: Mutex<Vec<TransportEndpointId>>,
    pub control: Mutex<Vec<(ControlType, TransportEndpointId)>>,
    pub consume: AtomicBool,
}

impl RecordingDemux {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl TransportDemux for RecordingDemux {
    fn deliver_raw_packet(&self, _: &Route, protocol: TransportProtocolId, _: &PacketBuffer) {
        self.raw.lock().unwrap().push(protocol);
    }

    fn deliver_packet(
        &self,
        _: &Route,
        _: TransportProtocolId,
        _: &mut PacketBuffer,
        id: &TransportEndpointId,
    ) -> bool {
        self.delivered.lock().unwrap().push(*id);
        self.consume.load(Ordering::SeqCst)
    }

    fn deliver_control_packet(
        &self,
        _: NetworkProtocolId,
        _: TransportProtocolId,
        typ: ControlType,
        _: u32,
        _: &PacketBuffer,
        id: &TransportEndpointId,
    ) -> bool {
        self.control.lock().unwrap().push((typ, *id));
        true
    }
}

pub(crate) struct StubTransportProtocol {
    number: TransportProtocolId,
    pub unknown_calls: Mutex<Vec<TransportEndpointId>>,
    pub consume_unknown: AtomicBool,
}

impl StubTransportProtocol {
    pub(crate) fn new(number: TransportProtocolId) -> Arc<Self> {
        Arc::new(Self {
            number,
            unknown_calls: Mutex::new(Vec::new()),
            consume_unknown: AtomicBool::new(false),
        })
    }
}

impl TransportProtocol for StubTransportProtocol {
    fn number(&self) -> TransportProtocolId {
        self.number
    }

    fn minimum_packet_size(&self) -> usize {
        4
    }

    fn parse_ports(&self, header: &[u8]) -> Result<(u16, u16)> {
        if header.len() < 4 {
            return Err(Error::Parse("transport header too short".into()));
        }
        Ok((
            u16::from_be_bytes([header[0], header[1]]),
            u16::from_be_bytes([header[2], header[3]]),
        ))
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> bool {
        pkt.consume_transport_header(4)
    }

    fn handle_unknown_destination_packet(
        &self,
        _: &Route,
        id: &TransportEndpointId,
        _: &mut PacketBuffer,
    ) -> bool {
        self.unknown_calls.lock().unwrap().push(*id);
        self.consume_unknown.load(Ordering::SeqCst)
    }
}

pub(crate) struct CountingIpTables {
    pub allow: AtomicBool,
    pub checked: Mutex<Vec<Option<IpAddr>>>,
}

impl CountingIpTables {
    pub(crate) fn new(allow: bool) -> Arc<Self> {
        Arc::new(Self {
            allow: AtomicBool::new(allow),
            checked: Mutex::new(Vec::new()),
        })
    }
}

impl IpTables for CountingIpTables {
    fn check_prerouting(
        &self,
        _: &mut PacketBuffer,
        nic_address: Option<IpAddr>,
        _: &str,
    ) -> bool {
        self.checked.lock().unwrap().push(nic_address);
        self.allow.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NdpEvent {
    DadStatus(Ipv6Addr, bool),
    RouterDiscovered(Ipv6Addr),
    RouterInvalidated(Ipv6Addr),
    PrefixDiscovered(Subnet),
    PrefixInvalidated(Subnet),
    AddrGenerated(AddressWithPrefix),
    AddrDeprecated(AddressWithPrefix),
    AddrInvalidated(AddressWithPrefix),
}

#[derive(Default)]
pub(crate) struct RecordingNdpDispatcher {
    events: Mutex<Vec<NdpEvent>>,
}

impl RecordingNdpDispatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<NdpEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn generated_addrs(&self) -> Vec<AddressWithPrefix> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                NdpEvent::AddrGenerated(a) => Some(a),
                _ => None,
            })
            .collect()
    }
}

impl NdpDispatcher for RecordingNdpDispatcher {
    fn on_duplicate_address_detection_status(&self, _: NicId, addr: Ipv6Addr, resolved: bool) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::DadStatus(addr, resolved));
    }

    fn on_default_router_discovered(&self, _: NicId, addr: Ipv6Addr) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::RouterDiscovered(addr));
    }

    fn on_default_router_invalidated(&self, _: NicId, addr: Ipv6Addr) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::RouterInvalidated(addr));
    }

    fn on_on_link_prefix_discovered(&self, _: NicId, prefix: Subnet) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::PrefixDiscovered(prefix));
    }

    fn on_on_link_prefix_invalidated(&self, _: NicId, prefix: Subnet) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::PrefixInvalidated(prefix));
    }

    fn on_auto_gen_address(&self, _: NicId, addr: AddressWithPrefix) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::AddrGenerated(addr));
    }

    fn on_auto_gen_address_deprecated(&self, _: NicId, addr: AddressWithPrefix) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::AddrDeprecated(addr));
    }

    fn on_auto_gen_address_invalidated(&self, _: NicId, addr: AddressWithPrefix) {
        self.events
            .lock()
            .unwrap()
            .push(NdpEvent::AddrInvalidated(addr));
    }
}

/// Route lookup backed by a closure.
pub(crate) struct FnRouteLookup {
    f: Box<dyn Fn(IpAddr, NetworkProtocolId) -> Result<Route> + Send + Sync>,
}

impl FnRouteLookup {
    pub(crate) fn new(
        f: impl Fn(IpAddr, NetworkProtocolId) -> Result<Route> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { f: Box::new(f) })
    }
}

impl RouteLookup for FnRouteLookup {
    fn find_route(&self, dst: IpAddr, protocol: NetworkProtocolId) -> Result<Route> {
        (self.f)(dst, protocol)
    }
}

// ---------------------------------------------------------------------------
// Environment

pub(crate) struct TestEnv {
    pub ctx: Arc<StackContext>,
    pub clock: Arc<ManualClock>,
    pub v4: Arc<StubNetworkProtocol>,
    pub v6: Arc<StubNetworkProtocol>,
    pub resolver_v4: Arc<StubResolver>,
    pub resolver_v6: Arc<StubResolver>,
    pub ndp_events: Arc<RecordingNdpDispatcher>,
    pub forwarder: Arc<RecordingForwarder>,
}

/// Build a stack context with stub IPv4/IPv6 protocols, resolvers for
/// both, a recording NDP dispatcher and a recording forwarder. `configure`
/// runs before the context is frozen.
pub(crate) fn build_env(configure: impl FnOnce(&mut StackContext)) -> TestEnv {
    let clock = ManualClock::new();
    let mut ctx = StackContext::new(clock.clone());

    let v4 = StubNetworkProtocol::v4();
    let v6 = StubNetworkProtocol::v6();
    ctx.add_network_protocol(v4.clone());
    ctx.add_network_protocol(v6.clone());

    let resolver_v4 = StubResolver::new(IPV4_PROTOCOL);
    let resolver_v6 = StubResolver::new(IPV6_PROTOCOL);
    ctx.add_link_addr_resolver(resolver_v4.clone());
    ctx.add_link_addr_resolver(resolver_v6.clone());

    let ndp_events = RecordingNdpDispatcher::new();
    ctx.set_ndp_dispatcher(ndp_events.clone());

    let forwarder = RecordingForwarder::new();
    ctx.set_forwarder(forwarder.clone());

    ctx.opaque_iid_secret = [0x5a; 32];

    configure(&mut ctx);

    TestEnv {
        ctx: Arc::new(ctx),
        clock,
        v4,
        v6,
        resolver_v4,
        resolver_v6,
        ndp_events,
        forwarder,
    }
}

// ---------------------------------------------------------------------------
// Packet builders matching the stub network protocols

pub(crate) fn v4_packet(src: Ipv4Addr, dst: Ipv4Addr, transport: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(9 + payload.len());
    bytes.extend_from_slice(&src.octets());
    bytes.extend_from_slice(&dst.octets());
    bytes.push(transport);
    bytes.extend_from_slice(payload);
    bytes
}

pub(crate) fn v6_packet(src: Ipv6Addr, dst: Ipv6Addr, transport: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(33 + payload.len());
    bytes.extend_from_slice(&src.octets());
    bytes.extend_from_slice(&dst.octets());
    bytes.push(transport);
    bytes.extend_from_slice(payload);
    bytes
}

pub(crate) fn mac(last: u8) -> LinkAddr {
    LinkAddr([0x02, 0x00, 0x00, 0x00, 0x00, last])
}
