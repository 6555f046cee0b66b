//! Network interface
//!
//! Binds one link endpoint to the network protocol engines configured on
//! the stack: owns the addresses assigned to the interface, dispatches
//! received packets into protocol endpoints, forwards packets towards
//! other interfaces when the stack routes, and drives IPv6 Neighbor
//! Discovery.
//!
//! A single reader-writer lock guards the mutable interface state
//! (`enabled`, `spoofing`, `promiscuous`, the packet-socket registry and
//! the NDP state). The protocol map, the stack context, the link endpoint
//! and the identifiers are immutable after construction; counters are
//! atomics.

use crate::config::{NdpConfigurations, NudConfigurations};
use crate::protocol::{
    is_ipv6_unicast, ipv6_link_local_subnet, AddressWithPrefix, LinkAddr, NetworkProtocolId,
    TransportProtocolId, ALL_PROTOCOLS, ARP_PROTOCOL, ICMPV4_TRANSPORT, ICMPV6_TRANSPORT,
    IPV4_PROTOCOL, IPV6_PROTOCOL,
};
use crate::protocol::icmpv6::RouterAdvertisement;
use crate::stack::address_table::{
    AddAddressOptions, AddressConfigType, AddressKind, PrimaryEndpointBehavior,
};
use crate::stack::context::StackContext;
use crate::stack::endpoints::{
    ControlType, LinkEndpoint, NetworkDispatcher, NetworkEndpoint, PacketEndpoint,
    TransportEndpointId,
};
use crate::stack::ndp::{NdpState, NdpTimerEvent};
use crate::stack::neighbor_cache::{NeighborCache, NeighborEntry};
use crate::stack::packet::{PacketBuffer, PacketType};
use crate::stack::referenced::ReferencedEndpoint;
use crate::stack::route::{Resolution, Route};
use crate::telemetry::NicStats;
use crate::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, RwLock, Weak};
use std::task::Waker;
use tracing::{debug, trace};

/// Interface identifier, unique within a stack
pub type NicId = u32;

/// Opaque value an integrator attaches to an interface at creation
pub type NicContext = Box<dyn Any + Send + Sync>;

/// An address together with the protocol it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolAddress {
    pub protocol: NetworkProtocolId,
    pub address_with_prefix: AddressWithPrefix,
}

/// Which permissive mode applies to an address lookup
#[derive(Clone, Copy)]
enum LookupMode {
    /// Outbound direction: observe the spoofing flag
    Spoofing,
    /// Inbound direction: observe the promiscuous flag
    Promiscuous,
}

/// Mutable interface state, guarded by `Nic::inner`.
pub(crate) struct NicInner {
    pub(crate) enabled: bool,
    pub(crate) spoofing: bool,
    pub(crate) promiscuous: bool,
    /// Registered packet sockets per ethertype. The lists are guarded by
    /// the interface lock; the endpoints themselves are not.
    pub(crate) packet_eps: HashMap<NetworkProtocolId, Vec<Arc<dyn PacketEndpoint>>>,
    pub(crate) ndp: NdpState,
}

pub struct Nic {
    ctx: Arc<StackContext>,
    id: NicId,
    name: String,
    link: Arc<dyn LinkEndpoint>,
    context: Option<NicContext>,
    stats: NicStats,
    neigh: Option<Arc<NeighborCache>>,
    network_endpoints: HashMap<NetworkProtocolId, Arc<dyn NetworkEndpoint>>,
    inner: RwLock<NicInner>,
    weak_self: Weak<Nic>,
}

impl Nic {
    /// Create an interface, instantiate every configured network protocol
    /// on it and attach to the link. The interface starts disabled.
    pub fn new(
        ctx: Arc<StackContext>,
        id: NicId,
        name: impl Into<String>,
        link: Arc<dyn LinkEndpoint>,
        context: Option<NicContext>,
    ) -> Arc<Self> {
        let name = name.into();
        let caps = link.capabilities();

        // A neighbor cache only exists when the link needs resolution and
        // the stack can actually resolve something.
        let neigh = if caps.resolution_required
            && ctx.has_link_addr_resolvers()
            && ctx.use_neighbor_cache
        {
            Some(NeighborCache::new(
                ctx.clock().clone(),
                ctx.nud_configs.clone(),
            ))
        } else {
            None
        };

        // Pre-seed the packet-socket registry with the supported
        // ethertypes; registration against anything else is refused.
        let mut packet_eps: HashMap<NetworkProtocolId, Vec<Arc<dyn PacketEndpoint>>> =
            HashMap::new();
        for proto in [IPV4_PROTOCOL, ARP_PROTOCOL, IPV6_PROTOCOL, ALL_PROTOCOLS] {
            packet_eps.insert(proto, Vec::new());
        }
        for (num, _) in ctx.network_protocols() {
            packet_eps.entry(*num).or_default();
        }

        let nic = Arc::new_cyclic(|weak: &Weak<Nic>| {
            let mut network_endpoints = HashMap::new();
            for (num, proto) in ctx.network_protocols() {
                network_endpoints.insert(
                    *num,
                    proto.new_endpoint(weak.clone(), neigh.clone(), link.clone(), ctx.clone()),
                );
            }
            Nic {
                inner: RwLock::new(NicInner {
                    enabled: false,
                    spoofing: false,
                    promiscuous: false,
                    packet_eps,
                    ndp: NdpState::new(ctx.ndp_configs.clone()),
                }),
                ctx: ctx.clone(),
                id,
                name,
                link: link.clone(),
                context,
                stats: NicStats::new(),
                neigh,
                network_endpoints,
                weak_self: weak.clone(),
            }
        });

        let dispatcher: Weak<dyn NetworkDispatcher> = nic.weak_self.clone();
        link.attach(Some(dispatcher));
        nic
    }

    pub fn id(&self) -> NicId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack(&self) -> &Arc<StackContext> {
        &self.ctx
    }

    pub fn link_endpoint(&self) -> &Arc<dyn LinkEndpoint> {
        &self.link
    }

    /// The opaque value supplied at creation, if any.
    pub fn context(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.context.as_deref()
    }

    pub fn stats(&self) -> &NicStats {
        &self.stats
    }

    pub fn is_loopback(&self) -> bool {
        self.link.capabilities().loopback
    }

    pub(crate) fn network_endpoint(
        &self,
        protocol: NetworkProtocolId,
    ) -> Option<&Arc<dyn NetworkEndpoint>> {
        self.network_endpoints.get(&protocol)
    }

    /// A weak handle to this interface, used by timer callbacks so a
    /// pending timer never keeps a removed interface alive.
    pub(crate) fn downgrade(&self) -> Weak<Nic> {
        self.weak_self.clone()
    }

    /// Snapshot of (enabled, spoofing, promiscuous).
    pub(crate) fn mode_flags(&self) -> (bool, bool, bool) {
        let inner = self.inner.read().unwrap();
        (inner.enabled, inner.spoofing, inner.promiscuous)
    }

    pub fn enabled(&self) -> bool {
        self.inner.read().unwrap().enabled
    }

    /// Enable the interface.
    ///
    /// With IPv6 configured this re-runs DAD for every permanent unicast
    /// address (other hosts may have claimed them while the interface was
    /// down), auto-generates a link-local address when the stack is
    /// configured to, and starts soliciting routers unless the stack is a
    /// router itself.
    pub fn enable(&self) -> Result<()> {
        if self.enabled() {
            return Ok(());
        }

        let mut inner = self.inner.write().unwrap();
        if inner.enabled {
            return Ok(());
        }
        inner.enabled = true;
        debug!(nic = self.name(), "enabling interface");

        for ep in self.network_endpoints.values() {
            ep.enable()?;
        }

        let Some(v6) = self.network_endpoints.get(&IPV6_PROTOCOL) else {
            return Ok(());
        };

        for entry in v6.all_endpoints() {
            let addr = entry.address();
            if !entry.kind().is_permanent() || !is_ipv6_unicast(addr) {
                entry.dec_ref();
                continue;
            }
            let ref_ = self.nep_to_ref(IPV6_PROTOCOL, v6.clone(), entry);
            ref_.set_kind(AddressKind::PermanentTentative);
            inner.ndp_start_dad(self, ref_)?;
        }

        // Loopback devices carry no auto-generated link-local address.
        if self.ctx.auto_gen_ipv6_link_local && !self.is_loopback() {
            inner.ndp_do_slaac(self, ipv6_link_local_subnet(), None, None);
        }

        // Routers do not learn from RAs, so soliciting them is pointless.
        if !self.ctx.forwarding() {
            inner.ndp_start_soliciting_routers(self);
        }

        Ok(())
    }

    /// Disable the interface, undoing the work done by enable.
    pub fn disable(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        self.disable_locked(&mut inner)
    }

    fn disable_locked(&self, inner: &mut NicInner) -> Result<()> {
        if !inner.enabled {
            return Ok(());
        }
        debug!(nic = self.name(), "disabling interface");

        if let Some(v6) = self.network_endpoints.get(&IPV6_PROTOCOL) {
            inner.ndp_stop_soliciting_routers();
            inner.ndp_cleanup_state(self, false);

            // Stop DAD for addresses still tentative.
            for entry in v6.all_endpoints() {
                if let IpAddr::V6(addr) = entry.address() {
                    if entry.kind() == AddressKind::PermanentTentative {
                        inner.ndp_stop_dad(addr);
                    }
                }
                entry.dec_ref();
            }
        }

        for ep in self.network_endpoints.values() {
            ep.disable()?;
        }

        inner.enabled = false;
        Ok(())
    }

    /// Remove the interface: disable it, leave every multicast group, drop
    /// every address, close the protocol endpoints and detach from the
    /// link. No packet crosses in either direction afterwards.
    ///
    /// Teardown continues past the first failure; the first error
    /// encountered is returned.
    pub fn remove(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let _ = self.disable_locked(&mut inner);

        let mut first_err = None;

        for ep in self.network_endpoints.values() {
            if let Some(gep) = ep.as_group() {
                if let Err(err) = gep.leave_all_groups() {
                    first_err.get_or_insert(err);
                }
            }
            if let Err(err) = ep.remove_all_addresses() {
                first_err.get_or_insert(err);
            }
            ep.close();
        }
        drop(inner);

        // Detach from the link, so no packet comes in.
        self.link.attach(None);
        debug!(nic = self.name(), "interface removed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Transition into an IPv6 router: host-learned state (discovered
    /// routers, on-link prefixes, global SLAAC addresses) is invalidated
    /// and router solicitation stops.
    pub fn become_ipv6_router(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.ndp_cleanup_state(self, true);
        inner.ndp_stop_soliciting_routers();
    }

    /// Transition into an IPv6 host: start soliciting routers. Only takes
    /// effect while the interface is enabled.
    pub fn become_ipv6_host(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.enabled {
            inner.ndp_start_soliciting_routers(self);
        }
    }

    pub fn set_promiscuous_mode(&self, enable: bool) {
        self.inner.write().unwrap().promiscuous = enable;
    }

    pub fn is_promiscuous_mode(&self) -> bool {
        self.inner.read().unwrap().promiscuous
    }

    pub fn set_spoofing(&self, enable: bool) {
        self.inner.write().unwrap().spoofing = enable;
    }

    /// Add a permanent address, so the interface starts accepting packets
    /// targeted at it. IPv6 unicast addresses start out tentative and
    /// only become usable once DAD succeeds.
    pub fn add_address(
        &self,
        protocol_address: ProtocolAddress,
        peb: PrimaryEndpointBehavior,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let ref_ = inner.add_address_locked(
            self,
            protocol_address.protocol,
            protocol_address.address_with_prefix,
            peb,
            AddressKind::Permanent,
            AddressConfigType::Static,
            false,
        )?;
        drop(ref_);
        Ok(())
    }

    /// Remove a permanent address.
    pub fn remove_address(&self, addr: IpAddr) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        self.remove_permanent_address_locked(&mut inner, addr)
    }

    fn remove_permanent_address_locked(
        &self,
        inner: &mut NicInner,
        addr: IpAddr,
    ) -> Result<()> {
        for (protocol, ep) in &self.network_endpoints {
            let Some(entry) = ep.get_endpoint(addr) else {
                continue;
            };
            if !entry.kind().is_permanent() {
                entry.dec_ref();
                return Err(Error::BadLocalAddress(addr));
            }

            let ref_ = self.nep_to_ref(*protocol, ep.clone(), entry);
            if *protocol == IPV6_PROTOCOL {
                return self.remove_permanent_ipv6_endpoint_locked(inner, ref_, true);
            }
            ref_.expire();
            return Ok(());
        }

        Err(Error::BadLocalAddress(addr))
    }

    /// Remove a permanent IPv6 address: stop DAD, release SLAAC resources
    /// for autoconfigured addresses, then expire the entry.
    pub(crate) fn remove_permanent_ipv6_endpoint_locked(
        &self,
        inner: &mut NicInner,
        ref_: ReferencedEndpoint,
        allow_slaac_invalidation: bool,
    ) -> Result<()> {
        let addr_wp = ref_.addr_with_prefix();

        if is_ipv6_unicast(addr_wp.address) {
            if let IpAddr::V6(addr) = addr_wp.address {
                inner.ndp_stop_dad(addr);
            }

            match ref_.config_type() {
                AddressConfigType::Slaac => {
                    inner.ndp_cleanup_slaac_addr(self, addr_wp, allow_slaac_invalidation)
                }
                AddressConfigType::SlaacTemp => {
                    inner.ndp_cleanup_temp_slaac_addr(self, addr_wp, allow_slaac_invalidation)
                }
                AddressConfigType::Static => {}
            }
        }

        ref_.expire();
        Ok(())
    }

    /// All addresses (primary and non-primary) assigned to the interface.
    pub fn all_addresses(&self) -> Vec<ProtocolAddress> {
        let mut addrs = Vec::new();
        for (protocol, ep) in &self.network_endpoints {
            for address_with_prefix in ep.all_addresses() {
                addrs.push(ProtocolAddress {
                    protocol: *protocol,
                    address_with_prefix,
                });
            }
        }
        addrs
    }

    /// The primary addresses of the interface, in primacy order per
    /// protocol.
    pub fn primary_addresses(&self) -> Vec<ProtocolAddress> {
        let mut addrs = Vec::new();
        for (protocol, ep) in &self.network_endpoints {
            for address_with_prefix in ep.primary_addresses() {
                addrs.push(ProtocolAddress {
                    protocol: *protocol,
                    address_with_prefix,
                });
            }
        }
        addrs
    }

    /// Source-address selection for traffic towards `remote` (None for
    /// unbound traffic).
    pub fn primary_endpoint(
        &self,
        protocol: NetworkProtocolId,
        remote: Option<IpAddr>,
    ) -> Option<ReferencedEndpoint> {
        let spoofing = self.inner.read().unwrap().spoofing;
        let ep = self.network_endpoints.get(&protocol)?;
        let entry = ep.primary_endpoint(remote, spoofing)?;
        Some(self.nep_to_ref(protocol, ep.clone(), entry))
    }

    /// The first non-deprecated primary address, falling back to the
    /// first deprecated one.
    pub fn primary_address(&self, protocol: NetworkProtocolId) -> Option<AddressWithPrefix> {
        self.primary_endpoint(protocol, None)
            .map(|ref_| ref_.addr_with_prefix())
    }

    /// True iff `addr` is assigned to this interface and still tentative.
    pub fn is_addr_tentative(&self, addr: IpAddr) -> bool {
        let Some(ep) = self.network_endpoints.get(&IPV6_PROTOCOL) else {
            return false;
        };
        let Some(entry) = ep.get_endpoint(addr) else {
            return false;
        };
        let tentative = entry.kind() == AddressKind::PermanentTentative;
        entry.dec_ref();
        tentative
    }

    /// Inform the interface that a tentative address turned out to be a
    /// duplicate on the link. The address is removed; SLAAC-generated
    /// addresses are regenerated (temporary ones without resetting the
    /// generation-attempt counter).
    pub fn dup_tentative_addr_detected(&self, addr: Ipv6Addr) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let ep = self
            .network_endpoints
            .get(&IPV6_PROTOCOL)
            .ok_or(Error::UnknownProtocol(IPV6_PROTOCOL))?;
        let Some(entry) = ep.get_endpoint(IpAddr::V6(addr)) else {
            return Err(Error::BadAddress(IpAddr::V6(addr)));
        };
        if entry.kind() != AddressKind::PermanentTentative {
            entry.dec_ref();
            return Err(Error::InvalidEndpointState);
        }

        debug!(nic = self.name(), %addr, "tentative address is a duplicate");
        let ref_ = self.nep_to_ref(IPV6_PROTOCOL, ep.clone(), entry);
        let prefix = ref_.addr_with_prefix().subnet();
        let config_type = ref_.config_type();

        if let Some(disp) = self.ctx.ndp_dispatcher() {
            disp.on_duplicate_address_detection_status(self.id, addr, false);
        }

        // The prefix is not invalidated: a replacement address will be
        // generated for it.
        self.remove_permanent_ipv6_endpoint_locked(&mut inner, ref_, false)?;

        match config_type {
            AddressConfigType::Slaac => inner.ndp_regenerate_slaac_addr(self, prefix),
            AddressConfigType::SlaacTemp => {
                inner.ndp_regenerate_temp_slaac_addr(self, prefix, false)
            }
            AddressConfigType::Static => {}
        }

        Ok(())
    }

    /// Replace the interface's NDP configuration; invalid values are
    /// fixed up to defaults first.
    pub fn set_ndp_configs(&self, mut configs: NdpConfigurations) {
        configs.validate();
        self.inner.write().unwrap().ndp.configs = configs;
    }

    /// Process a Router Advertisement received on this interface.
    pub fn handle_ndp_ra(&self, src: Ipv6Addr, ra: &RouterAdvertisement) {
        let mut inner = self.inner.write().unwrap();
        if !inner.enabled {
            return;
        }
        inner.ndp_handle_ra(self, src, ra);
    }

    pub(crate) fn ndp_timer_fired(&self, ev: NdpTimerEvent) {
        let mut inner = self.inner.write().unwrap();
        inner.ndp_handle_timer(self, ev);
    }

    // Neighbor cache operations. Without resolution capability every one
    // of them reports NotSupported.

    pub fn neighbor_cache(&self) -> Option<&Arc<NeighborCache>> {
        self.neigh.as_ref()
    }

    pub fn neighbors(&self) -> Result<Vec<NeighborEntry>> {
        match &self.neigh {
            Some(neigh) => Ok(neigh.entries()),
            None => Err(Error::NotSupported),
        }
    }

    pub fn add_static_neighbor(&self, addr: IpAddr, link_addr: LinkAddr) -> Result<()> {
        match &self.neigh {
            Some(neigh) => {
                neigh.add_static_entry(addr, link_addr);
                Ok(())
            }
            None => Err(Error::NotSupported),
        }
    }

    pub fn remove_neighbor(&self, addr: IpAddr) -> Result<()> {
        match &self.neigh {
            Some(neigh) => {
                if neigh.remove_entry(addr) {
                    Ok(())
                } else {
                    Err(Error::BadAddress(addr))
                }
            }
            None => Err(Error::NotSupported),
        }
    }

    pub fn clear_neighbors(&self) -> Result<()> {
        match &self.neigh {
            Some(neigh) => {
                neigh.clear();
                Ok(())
            }
            None => Err(Error::NotSupported),
        }
    }

    pub fn remove_waker(&self, addr: IpAddr, waker: &Waker) {
        if let Some(neigh) = &self.neigh {
            neigh.remove_waker(addr, waker);
        }
    }

    pub fn nud_configs(&self) -> Result<NudConfigurations> {
        match &self.neigh {
            Some(neigh) => Ok(neigh.config()),
            None => Err(Error::NotSupported),
        }
    }

    pub fn set_nud_configs(&self, mut configs: NudConfigurations) -> Result<()> {
        match &self.neigh {
            Some(neigh) => {
                configs.reset_invalid_fields();
                neigh.set_config(configs);
                Ok(())
            }
            None => Err(Error::NotSupported),
        }
    }

    // Multicast group membership, delegated to group-addressable network
    // endpoints. Join counts live in the endpoint; the interface only
    // orchestrates.

    pub fn join_group(&self, protocol: NetworkProtocolId, addr: IpAddr) -> Result<()> {
        let ep = self
            .network_endpoints
            .get(&protocol)
            .ok_or(Error::NotSupported)?;
        let gep = ep.as_group().ok_or(Error::NotSupported)?;
        gep.join_group(addr).map(|_| ())
    }

    pub fn leave_group(&self, protocol: NetworkProtocolId, addr: IpAddr) -> Result<()> {
        let ep = self
            .network_endpoints
            .get(&protocol)
            .ok_or(Error::NotSupported)?;
        let gep = ep.as_group().ok_or(Error::NotSupported)?;
        gep.leave_group(addr, false).map(|_| ())
    }

    /// True if any protocol endpoint has joined `addr`.
    pub fn is_in_group(&self, addr: IpAddr) -> bool {
        self.network_endpoints
            .values()
            .filter_map(|ep| ep.as_group())
            .any(|gep| gep.is_in_group(addr))
    }

    // Packet sockets.

    /// Register a packet endpoint for an ethertype (or ALL_PROTOCOLS).
    /// Ethertypes outside the advertised set are refused.
    pub fn register_packet_endpoint(
        &self,
        protocol: NetworkProtocolId,
        ep: Arc<dyn PacketEndpoint>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let eps = inner
            .packet_eps
            .get_mut(&protocol)
            .ok_or(Error::NotSupported)?;
        eps.push(ep);
        Ok(())
    }

    /// Unregister a packet endpoint. Unknown registrations are ignored.
    pub fn unregister_packet_endpoint(
        &self,
        protocol: NetworkProtocolId,
        ep: &Arc<dyn PacketEndpoint>,
    ) {
        let mut inner = self.inner.write().unwrap();
        if let Some(eps) = inner.packet_eps.get_mut(&protocol) {
            if let Some(i) = eps.iter().position(|other| Arc::ptr_eq(other, ep)) {
                eps.remove(i);
            }
        }
    }

    // Lookups.

    pub(crate) fn nep_to_ref(
        &self,
        protocol: NetworkProtocolId,
        ep: Arc<dyn NetworkEndpoint>,
        entry: Arc<crate::stack::address_table::AddressEntry>,
    ) -> ReferencedEndpoint {
        let (link_res, link_cache) = if self.link.capabilities().resolution_required {
            match self.ctx.link_addr_resolver(protocol) {
                Some(resolver) => (
                    Some(resolver.clone()),
                    Some(self.ctx.link_addr_cache().clone()),
                ),
                None => (None, None),
            }
        } else {
            (None, None)
        };
        ReferencedEndpoint::new(
            self.weak_self.clone(),
            protocol,
            ep,
            entry,
            link_res,
            link_cache,
        )
    }

    /// Inbound-direction lookup: honors the promiscuous flag.
    pub(crate) fn get_ref(
        &self,
        protocol: NetworkProtocolId,
        dst: IpAddr,
    ) -> Option<ReferencedEndpoint> {
        self.get_ref_or_create_temp(
            protocol,
            dst,
            PrimaryEndpointBehavior::CanBePrimary,
            LookupMode::Promiscuous,
        )
    }

    /// Outbound-direction lookup: honors the spoofing flag.
    pub fn find_endpoint(
        &self,
        protocol: NetworkProtocolId,
        addr: IpAddr,
        peb: PrimaryEndpointBehavior,
    ) -> Option<ReferencedEndpoint> {
        self.get_ref_or_create_temp(protocol, addr, peb, LookupMode::Spoofing)
    }

    fn get_ref_or_create_temp(
        &self,
        protocol: NetworkProtocolId,
        addr: IpAddr,
        peb: PrimaryEndpointBehavior,
        mode: LookupMode,
    ) -> Option<ReferencedEndpoint> {
        let create_temp = {
            let inner = self.inner.read().unwrap();
            match mode {
                LookupMode::Spoofing => inner.spoofing,
                LookupMode::Promiscuous => inner.promiscuous,
            }
        };
        self.get_ref_or_create_temp_with(protocol, addr, create_temp, peb)
    }

    /// Lookup with the permissive bit already decided.
    pub(crate) fn get_ref_or_create_temp_with(
        &self,
        protocol: NetworkProtocolId,
        addr: IpAddr,
        create_temp: bool,
        peb: PrimaryEndpointBehavior,
    ) -> Option<ReferencedEndpoint> {
        let ep = self.network_endpoints.get(&protocol)?;
        let entry = ep.get_assigned_endpoint(addr, self.is_loopback(), create_temp, peb)?;
        Some(self.nep_to_ref(protocol, ep.clone(), entry))
    }

    // Egress.

    /// Emit a packet that is being forwarded through this interface. A
    /// fresh buffer is built with enough headroom for this link's header.
    ///
    /// The network endpoint on the forwarded route is responsible for the
    /// TTL/hop-limit decrement; it does not happen here.
    pub(crate) fn forward_packet(
        &self,
        route: &Route,
        protocol: NetworkProtocolId,
        pkt: &PacketBuffer,
    ) {
        let fwd = PacketBuffer::with_headroom(self.link.max_header_length(), pkt.full());
        let num_bytes = fwd.size();

        match self.link.write_packet(route, protocol, fwd) {
            Ok(()) => self.stats.tx.record(num_bytes),
            Err(_) => self.ctx.stats.ip.outgoing_packet_errors.inc(),
        }
    }

    // Transport-layer delivery.

    /// Deliver a packet to the transport protocol addressed by the parsed
    /// network header.
    pub fn deliver_transport_packet(
        &self,
        route: &Route,
        protocol: TransportProtocolId,
        mut pkt: PacketBuffer,
    ) {
        let Some(state) = self.ctx.transport_protocol(protocol) else {
            self.ctx.stats.unknown_protocol_rcvd_packets.inc();
            return;
        };
        let trans_proto = state.proto.clone();

        // Raw sockets see the packet based solely on the protocol number,
        // before any validation.
        self.ctx.demux().deliver_raw_packet(route, protocol, &pkt);

        if !pkt.has_transport_header() {
            if protocol == ICMPV4_TRANSPORT || protocol == ICMPV6_TRANSPORT {
                // ICMP carries its ports (type/code/identifier) within the
                // minimum header.
                if !pkt.consume_transport_header(trans_proto.minimum_packet_size()) {
                    self.ctx.stats.malformed_rcvd_packets.inc();
                    return;
                }
            } else {
                // Either a bad packet or one reassembled from fragments.
                trans_proto.parse(&mut pkt);
            }
        }

        if pkt.transport_header().len() < trans_proto.minimum_packet_size() {
            self.ctx.stats.malformed_rcvd_packets.inc();
            return;
        }

        let Ok((src_port, dst_port)) = trans_proto.parse_ports(pkt.transport_header()) else {
            self.ctx.stats.malformed_rcvd_packets.inc();
            return;
        };

        let id = TransportEndpointId {
            local_port: dst_port,
            local_address: route.local_address,
            remote_port: src_port,
            remote_address: route.remote_address,
        };
        if self.ctx.demux().deliver_packet(route, protocol, &mut pkt, &id) {
            return;
        }

        if let Some(handler) = &state.default_handler {
            if handler(route, &id, &mut pkt) {
                return;
            }
        }

        if !trans_proto.handle_unknown_destination_packet(route, &id, &mut pkt) {
            self.ctx.stats.malformed_rcvd_packets.inc();
        }
    }

    /// Deliver a transport control (error) packet to the endpoint that
    /// owns the embedded flow.
    pub fn deliver_transport_control_packet(
        &self,
        local: IpAddr,
        remote: IpAddr,
        net: NetworkProtocolId,
        trans: TransportProtocolId,
        typ: ControlType,
        extra: u32,
        pkt: PacketBuffer,
    ) {
        let Some(state) = self.ctx.transport_protocol(trans) else {
            return;
        };

        // ICMPv4 only guarantees 8 bytes of the embedded transport header,
        // which is enough for the ports of every known transport protocol.
        let Some(header) = pkt.data().get(..8) else {
            return;
        };
        let Ok((src_port, dst_port)) = state.proto.parse_ports(header) else {
            return;
        };

        let id = TransportEndpointId {
            local_port: src_port,
            local_address: local,
            remote_port: dst_port,
            remote_address: remote,
        };
        self.ctx
            .demux()
            .deliver_control_packet(net, trans, typ, extra, &pkt, &id);
    }
}

impl NicInner {
    /// Add an address while holding the interface lock. IPv6 unicast
    /// addresses added as permanent become tentative, and DAD starts
    /// immediately when the interface is enabled.
    pub(crate) fn add_address_locked(
        &mut self,
        nic: &Nic,
        protocol: NetworkProtocolId,
        addr: AddressWithPrefix,
        peb: PrimaryEndpointBehavior,
        kind: AddressKind,
        config_type: AddressConfigType,
        deprecated: bool,
    ) -> Result<ReferencedEndpoint> {
        let ep = nic
            .network_endpoints
            .get(&protocol)
            .ok_or(Error::UnknownProtocol(protocol))?;

        let entry = ep.add_address(
            addr,
            AddAddressOptions {
                kind,
                config_type,
                peb,
                deprecated,
            },
        )?;
        let ref_ = nic.nep_to_ref(protocol, ep.clone(), entry);

        let v6_unicast = protocol == IPV6_PROTOCOL && is_ipv6_unicast(addr.address);
        if v6_unicast && kind == AddressKind::Permanent {
            ref_.set_kind(AddressKind::PermanentTentative);
        }

        if v6_unicast && ref_.kind() == AddressKind::PermanentTentative && self.enabled {
            self.ndp_start_dad(nic, ref_.clone_ref())?;
        }

        Ok(ref_)
    }
}

impl NetworkDispatcher for Nic {
    /// Receive path. Called serially by the link endpoint for every
    /// inbound frame.
    fn deliver_network_packet(
        &self,
        remote: Option<LinkAddr>,
        local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        mut pkt: PacketBuffer,
    ) {
        {
            let inner = self.inner.read().unwrap();
            if !inner.enabled {
                drop(inner);
                self.stats.disabled_rx.record(pkt.size());
                return;
            }
        }

        self.stats.rx.record(pkt.size());

        let Some(net_proto) = self.ctx.network_protocol(protocol) else {
            self.ctx.stats.unknown_protocol_rcvd_packets.inc();
            return;
        };

        // Frames without a local link address were sent directly to us.
        let local = local.or_else(|| Some(self.link.link_address()));

        // Snapshot the packet sockets subscribed to this ethertype plus
        // the match-all ones, then fan out a clone to each.
        let packet_eps: Vec<Arc<dyn PacketEndpoint>> = {
            let inner = self.inner.read().unwrap();
            let mut eps = inner
                .packet_eps
                .get(&protocol)
                .cloned()
                .unwrap_or_default();
            if let Some(all) = inner.packet_eps.get(&ALL_PROTOCOLS) {
                eps.extend(all.iter().cloned());
            }
            eps
        };
        for ep in &packet_eps {
            let mut clone = pkt.clone();
            clone.pkt_type = PacketType::Host;
            ep.handle_packet(self.id, local, protocol, clone);
        }

        if protocol == IPV4_PROTOCOL || protocol == IPV6_PROTOCOL {
            self.ctx.stats.ip.packets_received.inc();
        }

        let Some((trans_proto, has_transport_hdr)) = net_proto.parse(&mut pkt) else {
            // Too small to even contain a network header.
            self.ctx.stats.malformed_rcvd_packets.inc();
            return;
        };
        if has_transport_hdr {
            // Best effort; the transport layer re-checks.
            if let Some(state) = self.ctx.transport_protocol(trans_proto) {
                state.proto.parse(&mut pkt);
            }
        }

        let (src, dst) = net_proto.parse_addresses(pkt.network_header());

        if self.ctx.handle_local && !self.is_loopback() {
            if let Some(ref_) = self.get_ref(protocol, src) {
                // One of our own addresses sourced this packet off-host.
                // Loopback is exempt since it hairpins by construction.
                drop(ref_);
                self.ctx.stats.ip.invalid_source_addresses_received.inc();
                return;
            }
        }

        // IPv6 filtering hooks are not wired up yet; loopback skips the
        // prerouting chain.
        if protocol == IPV4_PROTOCOL && !self.is_loopback() {
            let address = self.primary_address(protocol).map(|a| a.address);
            if !self
                .ctx
                .iptables()
                .check_prerouting(&mut pkt, address, &self.name)
            {
                trace!(nic = self.name(), "packet dropped by prerouting chain");
                return;
            }
        }

        if let Some(ref_) = self.get_ref(protocol, dst) {
            let ep = ref_.network_endpoint().clone();
            let route = Route::for_local_delivery(
                dst,
                src,
                Some(self.link.link_address()),
                remote,
                ref_,
            );
            ep.handle_packet(&route, pkt);
            return;
        }

        // Not ours. If the stack routes, look for an interface that wants
        // the packet and forward it there.
        if self.ctx.forwarding() {
            let mut route = match self.ctx.find_route(dst, protocol) {
                Ok(route) => route,
                Err(_) => {
                    self.ctx
                        .stats
                        .ip
                        .invalid_destination_addresses_received
                        .inc();
                    return;
                }
            };
            let Some(target) = route.nic() else {
                self.ctx
                    .stats
                    .ip
                    .invalid_destination_addresses_received
                    .inc();
                return;
            };

            // The target interface itself may own the destination.
            if let Some(target_ref) = target.get_ref_or_create_temp_with(
                protocol,
                dst,
                false,
                PrimaryEndpointBehavior::NeverPrimary,
            ) {
                if target_ref.is_valid_for_outgoing() {
                    route.local_link_address = Some(target.link_endpoint().link_address());
                    route.remote_link_address = remote;
                    route.remote_address = src;
                    let ep = target_ref.network_endpoint().clone();
                    ep.handle_packet(&route, pkt);
                    drop(target_ref);
                    return;
                }
                drop(target_ref);
            }

            match route.resolve() {
                Ok(Resolution::Resolved) => {
                    target.forward_packet(&route, protocol, &pkt);
                }
                Ok(Resolution::Pending(resolution)) => {
                    // The queue owns the route from here on.
                    self.ctx
                        .forwarder()
                        .enqueue(resolution, target, route, protocol, pkt);
                }
                Err(_) => {
                    self.ctx
                        .stats
                        .ip
                        .invalid_destination_addresses_received
                        .inc();
                }
            }
            return;
        }

        // A packet socket consuming the frame keeps it from being counted
        // as an invalid destination.
        if packet_eps.is_empty() {
            self.ctx
                .stats
                .ip
                .invalid_destination_addresses_received
                .inc();
        }
    }

    /// Outbound observation path: only match-all packet sockets see
    /// egress frames, with the link-layer header synthesized in front.
    fn deliver_outbound_packet(
        &self,
        remote: Option<LinkAddr>,
        local: Option<LinkAddr>,
        protocol: NetworkProtocolId,
        pkt: PacketBuffer,
    ) {
        let packet_eps: Vec<Arc<dyn PacketEndpoint>> = {
            let inner = self.inner.read().unwrap();
            inner
                .packet_eps
                .get(&ALL_PROTOCOLS)
                .cloned()
                .unwrap_or_default()
        };
        for ep in &packet_eps {
            let mut clone = pkt.clone();
            clone.pkt_type = PacketType::Outgoing;
            // Outgoing packets are intercepted before the link header is
            // created, so build it here.
            self.link.add_header(local, remote, protocol, &mut clone);
            ep.handle_packet(self.id, local, protocol, clone);
        }
    }
}

impl std::fmt::Debug for Nic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nic")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::icmpv6::{PrefixInformation, RouterAdvertisement};
    use crate::protocol::{solicited_node_multicast, Subnet, UDP_TRANSPORT};
    use crate::stack::route::Route;
    use crate::testutil::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    fn v4_addr(s: &str) -> ProtocolAddress {
        let (addr, prefix) = s.split_once('/').unwrap();
        ProtocolAddress {
            protocol: IPV4_PROTOCOL,
            address_with_prefix: AddressWithPrefix::new(addr.parse().unwrap(), prefix.parse().unwrap()),
        }
    }

    fn v6_addr(s: &str) -> ProtocolAddress {
        let (addr, prefix) = s.split_once('/').unwrap();
        ProtocolAddress {
            protocol: IPV6_PROTOCOL,
            address_with_prefix: AddressWithPrefix::new(addr.parse().unwrap(), prefix.parse().unwrap()),
        }
    }

    fn has_address(nic: &Nic, addr: &str) -> bool {
        let addr: IpAddr = addr.parse().unwrap();
        nic.all_addresses()
            .iter()
            .any(|a| a.address_with_prefix.address == addr)
    }

    fn ns_probes(link: &StubLinkEndpoint) -> Vec<WrittenPacket> {
        link.written()
            .into_iter()
            .filter(|w| w.protocol == IPV6_PROTOCOL && w.bytes[0] == 135)
            .collect()
    }

    fn rs_probes(link: &StubLinkEndpoint) -> Vec<WrittenPacket> {
        link.written()
            .into_iter()
            .filter(|w| w.protocol == IPV6_PROTOCOL && w.bytes[0] == 133)
            .collect()
    }

    #[test]
    fn test_starts_disabled_and_attached() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);

        assert!(!nic.enabled());
        assert!(link.attached());
        assert_eq!(nic.id(), 1);
        assert_eq!(nic.name(), "eth0");
        assert!(!nic.is_loopback());

        // Both configured protocols got an endpoint.
        assert_eq!(env.v4.endpoints().len(), 1);
        assert_eq!(env.v6.endpoints().len(), 1);
    }

    #[test]
    fn test_enable_disable_idempotent() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);

        nic.enable().unwrap();
        nic.enable().unwrap();
        assert!(nic.enabled());
        assert!(env.v4.endpoint(0).is_enabled());

        nic.disable().unwrap();
        nic.disable().unwrap();
        assert!(!nic.enabled());
        assert!(!env.v4.endpoint(0).is_enabled());
    }

    #[test]
    fn test_ipv4_primary_follows_peb_order() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        nic.add_address(v4_addr("10.0.0.2/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        assert_eq!(
            nic.primary_address(IPV4_PROTOCOL).unwrap().address,
            "10.0.0.2".parse::<IpAddr>().unwrap()
        );

        nic.add_address(v4_addr("10.0.0.3/24"), PrimaryEndpointBehavior::FirstPrimary)
            .unwrap();
        assert_eq!(
            nic.primary_address(IPV4_PROTOCOL).unwrap().address,
            "10.0.0.3".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_add_address_unknown_protocol() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);

        let err = nic
            .add_address(
                ProtocolAddress {
                    protocol: 0x9999,
                    address_with_prefix: AddressWithPrefix::new(
                        "10.0.0.1".parse().unwrap(),
                        24,
                    ),
                },
                PrimaryEndpointBehavior::CanBePrimary,
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(0x9999)));
    }

    #[test]
    fn test_dad_success() {
        let env = build_env(|ctx| {
            ctx.ndp_configs.dup_addr_detect_transmits = 3;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();

        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();

        // Disabled: tentative, no probes, not primary.
        assert!(nic.is_addr_tentative(IpAddr::V6(addr)));
        assert!(nic.primary_address(IPV6_PROTOCOL).is_none());
        assert!(ns_probes(&link).is_empty());

        nic.enable().unwrap();
        assert!(nic.is_addr_tentative(IpAddr::V6(addr)));

        // First probe fires straight away, the rest one interval apart.
        env.clock.advance(Duration::ZERO);
        assert_eq!(ns_probes(&link).len(), 1);
        env.clock.advance(Duration::from_secs(1));
        env.clock.advance(Duration::from_secs(1));
        assert_eq!(ns_probes(&link).len(), 3);
        assert!(nic.is_addr_tentative(IpAddr::V6(addr)));

        // One more interval with no conflict resolves DAD.
        env.clock.advance(Duration::from_secs(1));
        assert!(!nic.is_addr_tentative(IpAddr::V6(addr)));
        assert_eq!(
            nic.primary_address(IPV6_PROTOCOL).unwrap().address,
            IpAddr::V6(addr)
        );
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::DadStatus(addr, true)));

        // Probes went to the solicited-node group from the unspecified
        // address.
        let probe = &ns_probes(&link)[0];
        assert_eq!(
            probe.remote_address,
            IpAddr::V6(solicited_node_multicast(addr))
        );
        assert_eq!(
            probe.local_address,
            "::".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            probe.remote_link_address,
            Some(LinkAddr::ipv6_multicast(solicited_node_multicast(addr)))
        );
    }

    #[test]
    fn test_dad_conflict_removes_address() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();

        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();
        env.clock.advance(Duration::ZERO);
        assert_eq!(ns_probes(&link).len(), 1);

        nic.dup_tentative_addr_detected(addr).unwrap();

        assert!(!has_address(&nic, "2001:db8::1"));
        assert!(nic.primary_address(IPV6_PROTOCOL).is_none());
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::DadStatus(addr, false)));

        // The address is gone, so a second report has nothing to act on.
        assert!(matches!(
            nic.dup_tentative_addr_detected(addr),
            Err(Error::BadAddress(_))
        ));

        // The pending DAD timer was cancelled with the address.
        link.clear_written();
        env.clock.advance(Duration::from_secs(10));
        assert!(ns_probes(&link).is_empty());
    }

    #[test]
    fn test_dup_detected_on_resolved_address_is_invalid() {
        let env = build_env(|ctx| {
            ctx.ndp_configs.dup_addr_detect_transmits = 0;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();

        nic.enable().unwrap();
        // With zero transmits the address resolves immediately.
        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        assert!(!nic.is_addr_tentative(IpAddr::V6(addr)));

        assert!(matches!(
            nic.dup_tentative_addr_detected(addr),
            Err(Error::InvalidEndpointState)
        ));
    }

    #[test]
    fn test_remove_address_and_readd() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.remove_address(addr).unwrap();
        assert!(!has_address(&nic, "10.0.0.1"));

        // No expired leftover blocks the second add.
        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        assert!(has_address(&nic, "10.0.0.1"));

        assert!(matches!(
            nic.remove_address("192.0.2.7".parse().unwrap()),
            Err(Error::BadLocalAddress(_))
        ));
    }

    #[test]
    fn test_remove_during_delivery_keeps_handle_usable() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        let ref_ = nic
            .find_endpoint(IPV4_PROTOCOL, addr, PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();

        nic.remove_address(addr).unwrap();

        // The held reference survives removal.
        assert_eq!(ref_.kind(), AddressKind::PermanentExpired);
        assert_eq!(ref_.entry().ref_count(), 1);
        assert!(!ref_.is_valid_for_outgoing());

        // Spoofing revalidates the expired endpoint for egress.
        nic.set_spoofing(true);
        assert!(ref_.is_valid_for_outgoing());

        drop(ref_);
        assert!(nic
            .find_endpoint(IPV4_PROTOCOL, addr, PrimaryEndpointBehavior::CanBePrimary)
            .is_none());
    }

    #[test]
    fn test_disabled_nic_counts_only_disabled_rx() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);

        let sock: Arc<dyn PacketEndpoint> = RecordingPacketEndpoint::new();
        nic.register_packet_endpoint(ALL_PROTOCOLS, sock.clone()).unwrap();

        let bytes = v4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            0,
            b"hello",
        );
        let size = bytes.len() as u64;
        link.inject(Some(mac(2)), None, IPV4_PROTOCOL, bytes);

        assert_eq!(nic.stats().disabled_rx.packets.get(), 1);
        assert_eq!(nic.stats().disabled_rx.bytes.get(), size);
        assert_eq!(nic.stats().rx.packets.get(), 0);
        assert!(env.v4.endpoint(0).delivered().is_empty());
        assert_eq!(env.ctx.stats.ip.packets_received.get(), 0);
    }

    #[test]
    fn test_local_delivery() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        let bytes = v4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            0,
            b"ping",
        );
        link.inject(Some(mac(2)), None, IPV4_PROTOCOL, bytes);

        let delivered = env.v4.endpoint(0).delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].local_address,
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            delivered[0].remote_address,
            "10.0.0.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(delivered[0].remote_link_address, Some(mac(2)));

        assert_eq!(nic.stats().rx.packets.get(), 1);
        assert_eq!(env.ctx.stats.ip.packets_received.get(), 1);
    }

    #[test]
    fn test_ipv6_local_delivery_after_dad() {
        let env = build_env(|ctx| {
            ctx.ndp_configs.dup_addr_detect_transmits = 0;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        link.inject(
            Some(mac(2)),
            None,
            IPV6_PROTOCOL,
            v6_packet(
                "2001:db8::2".parse().unwrap(),
                "2001:db8::1".parse().unwrap(),
                0,
                b"six",
            ),
        );

        let delivered = env.v6.endpoint(0).delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].local_address,
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            delivered[0].remote_address,
            "2001:db8::2".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_promiscuous_synthesizes_temporary_endpoint() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        // Without promiscuous mode the foreign destination is dropped.
        link.inject(
            Some(mac(2)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 0, 99), 0, b"x"),
        );
        assert!(env.v4.endpoint(0).delivered().is_empty());
        assert_eq!(
            env.ctx.stats.ip.invalid_destination_addresses_received.get(),
            1
        );

        nic.set_promiscuous_mode(true);
        link.inject(
            Some(mac(2)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 0, 99), 0, b"x"),
        );

        let delivered = env.v4.endpoint(0).delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].local_address,
            "10.0.0.99".parse::<IpAddr>().unwrap()
        );
        assert_eq!(nic.stats().rx.packets.get(), 2);

        // The temporary endpoint lived only for the delivery.
        assert!(env
            .v4
            .endpoint(0)
            .get_endpoint("10.0.0.99".parse().unwrap())
            .is_none());
    }

    #[test]
    fn test_handle_local_drops_own_source() {
        let env = build_env(|ctx| {
            ctx.handle_local = true;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        link.inject(
            Some(mac(2)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 1), 0, b"x"),
        );

        assert_eq!(env.ctx.stats.ip.invalid_source_addresses_received.get(), 1);
        assert!(env.v4.endpoint(0).delivered().is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_protocol_counters() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.enable().unwrap();

        // Unknown ethertype.
        link.inject(Some(mac(2)), None, 0x1234, vec![1, 2, 3, 4]);
        assert_eq!(env.ctx.stats.unknown_protocol_rcvd_packets.get(), 1);

        // Too short for the network header.
        link.inject(Some(mac(2)), None, IPV4_PROTOCOL, vec![1, 2, 3]);
        assert_eq!(env.ctx.stats.malformed_rcvd_packets.get(), 1);

        assert_eq!(nic.stats().rx.packets.get(), 2);
    }

    #[test]
    fn test_iptables_prerouting_drop() {
        let tables = CountingIpTables::new(false);
        let tables_clone = tables.clone();
        let env = build_env(move |ctx| {
            ctx.set_iptables(tables_clone);
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        link.inject(
            Some(mac(2)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 0, b"x"),
        );

        // The hook saw the interface's primary address and rejected.
        assert_eq!(
            tables.checked.lock().unwrap().as_slice(),
            &[Some("10.0.0.1".parse::<IpAddr>().unwrap())]
        );
        assert!(env.v4.endpoint(0).delivered().is_empty());

        tables.allow.store(true, std::sync::atomic::Ordering::SeqCst);
        link.inject(
            Some(mac(2)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 0, b"x"),
        );
        assert_eq!(env.v4.endpoint(0).delivered().len(), 1);
    }

    #[test]
    fn test_packet_socket_fanout() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.enable().unwrap();

        let sock_v4 = RecordingPacketEndpoint::new();
        let sock_all = RecordingPacketEndpoint::new();
        let sock_v4_dyn: Arc<dyn PacketEndpoint> = sock_v4.clone();
        let sock_all_dyn: Arc<dyn PacketEndpoint> = sock_all.clone();

        nic.register_packet_endpoint(IPV4_PROTOCOL, sock_v4_dyn.clone())
            .unwrap();
        nic.register_packet_endpoint(ALL_PROTOCOLS, sock_all_dyn.clone())
            .unwrap();
        assert!(matches!(
            nic.register_packet_endpoint(0x9999, sock_all_dyn.clone()),
            Err(Error::NotSupported)
        ));

        let bytes = v4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 42),
            0,
            b"observed",
        );
        link.inject(Some(mac(2)), None, IPV4_PROTOCOL, bytes.clone());

        for sock in [&sock_v4, &sock_all] {
            let received = sock.received();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].nic, 1);
            assert_eq!(received[0].pkt_type, PacketType::Host);
            assert_eq!(received[0].bytes, bytes);
        }

        // A consumed frame is not an invalid destination.
        assert_eq!(
            env.ctx.stats.ip.invalid_destination_addresses_received.get(),
            0
        );

        // Unregistering is idempotent.
        nic.unregister_packet_endpoint(IPV4_PROTOCOL, &sock_v4_dyn);
        nic.unregister_packet_endpoint(IPV4_PROTOCOL, &sock_v4_dyn);

        link.inject(Some(mac(2)), None, IPV4_PROTOCOL, bytes);
        assert_eq!(sock_v4.received().len(), 1);
        assert_eq!(sock_all.received().len(), 2);
    }

    #[test]
    fn test_outbound_packets_reach_only_match_all_sockets() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        let sock_v4 = RecordingPacketEndpoint::new();
        let sock_all = RecordingPacketEndpoint::new();
        nic.register_packet_endpoint(IPV4_PROTOCOL, sock_v4.clone())
            .unwrap();
        nic.register_packet_endpoint(ALL_PROTOCOLS, sock_all.clone())
            .unwrap();

        let pkt = PacketBuffer::with_headroom(14, b"outgoing");
        nic.deliver_outbound_packet(Some(mac(9)), Some(mac(1)), IPV4_PROTOCOL, pkt);

        assert!(sock_v4.received().is_empty());
        let received = sock_all.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].pkt_type, PacketType::Outgoing);
        // The link-layer header was synthesized in front of the clone.
        assert_eq!(received[0].link_header.len(), 14);
        assert_eq!(&received[0].link_header[..6], &mac(9).0);
    }

    fn forwarding_pair(env: &TestEnv) -> (Arc<Nic>, Arc<Nic>, Arc<StubLinkEndpoint>, Arc<StubLinkEndpoint>) {
        let link_a = StubLinkEndpoint::ethernet(mac(1));
        let link_b = StubLinkEndpoint::ethernet(mac(2));
        let nic_a = Nic::new(env.ctx.clone(), 1, "eth0", link_a.clone(), None);
        let nic_b = Nic::new(env.ctx.clone(), 2, "eth1", link_b.clone(), None);

        nic_a
            .add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic_b
            .add_address(v4_addr("10.0.1.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic_a.enable().unwrap();
        nic_b.enable().unwrap();

        env.ctx.set_forwarding(true);
        (nic_a, nic_b, link_a, link_b)
    }

    fn route_via(slot: &Arc<Mutex<Option<Arc<Nic>>>>) -> Arc<FnRouteLookup> {
        let slot = slot.clone();
        FnRouteLookup::new(move |dst, protocol| {
            let nic = slot
                .lock()
                .unwrap()
                .clone()
                .ok_or(Error::NoRoute(dst))?;
            let ref_ = nic
                .primary_endpoint(protocol, Some(dst))
                .ok_or(Error::NoRoute(dst))?;
            let local = ref_.address();
            Ok(Route::new(local, dst, None, None, None, Some(ref_)))
        })
    }

    #[test]
    fn test_forwarding_delivers_to_target_nic_address() {
        let slot = Arc::new(Mutex::new(None));
        let lookup = route_via(&slot);
        let env = build_env(move |ctx| {
            ctx.set_route_lookup(lookup);
        });
        let (_nic_a, nic_b, link_a, _link_b) = forwarding_pair(&env);
        *slot.lock().unwrap() = Some(nic_b.clone());

        // Destination owned by the target interface: delivered there, with
        // the link addresses rewritten.
        link_a.inject(
            Some(mac(7)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 1, 1), 0, b"x"),
        );

        let delivered = env.v4.endpoint(1).delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].remote_address,
            "10.0.0.50".parse::<IpAddr>().unwrap()
        );
        assert_eq!(delivered[0].remote_link_address, Some(mac(7)));
        assert!(env.v4.endpoint(0).delivered().is_empty());
    }

    #[test]
    fn test_forwarding_with_pending_resolution_enqueues() {
        let slot = Arc::new(Mutex::new(None));
        let lookup = route_via(&slot);
        let env = build_env(move |ctx| {
            ctx.set_route_lookup(lookup);
        });
        let (_nic_a, nic_b, link_a, link_b) = forwarding_pair(&env);
        *slot.lock().unwrap() = Some(nic_b.clone());

        let dst: IpAddr = "10.0.1.99".parse().unwrap();
        link_a.inject(
            Some(mac(7)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 1, 99), 0, b"fwd"),
        );

        // Nothing was emitted; the packet sits in the forwarding queue
        // with its resolution channel, and a request went out.
        assert!(link_b.written().is_empty());
        assert_eq!(env.forwarder.len(), 1);
        assert_eq!(env.resolver_v4.requests(), vec![dst]);

        let mut pending = env.forwarder.take();
        let fwd = &mut pending[0];
        assert_eq!(fwd.nic.id(), nic_b.id());
        assert_eq!(fwd.protocol, IPV4_PROTOCOL);
        assert_eq!(fwd.route.remote_address, dst);

        // Resolution completes: the channel fires and the queue can emit.
        env.ctx.link_addr_cache().add(dst, mac(9));
        assert_eq!(fwd.resolution.try_recv().unwrap(), Some(mac(9)));

        match fwd.route.resolve().unwrap() {
            crate::stack::route::Resolution::Resolved => {}
            _ => panic!("route should resolve from the cache now"),
        }
        fwd.nic.forward_packet(&fwd.route, fwd.protocol, &fwd.pkt);

        let written = link_b.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].remote_link_address, Some(mac(9)));
        assert_eq!(nic_b.stats().tx.packets.get(), 1);
    }

    #[test]
    fn test_forwarding_without_route_counts_invalid_destination() {
        let env = build_env(|_| {});
        let (_nic_a, _nic_b, link_a, _link_b) = forwarding_pair(&env);

        link_a.inject(
            Some(mac(7)),
            None,
            IPV4_PROTOCOL,
            v4_packet(Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(192, 0, 2, 1), 0, b"x"),
        );

        assert_eq!(
            env.ctx.stats.ip.invalid_destination_addresses_received.get(),
            1
        );
    }

    #[test]
    fn test_forward_packet_write_error_counts() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.enable().unwrap();

        link.set_fail_writes(true);
        let route = Route::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.1.99".parse().unwrap(),
            None,
            Some(mac(9)),
            None,
            None,
        );
        nic.forward_packet(&route, IPV4_PROTOCOL, &PacketBuffer::new(vec![1, 2, 3]));

        assert_eq!(env.ctx.stats.ip.outgoing_packet_errors.get(), 1);
        assert_eq!(nic.stats().tx.packets.get(), 0);
    }

    #[test]
    fn test_remove_detaches_and_tears_down() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v4_addr("10.0.0.1/24"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.join_group(IPV4_PROTOCOL, "224.0.0.1".parse().unwrap())
            .unwrap();
        nic.enable().unwrap();

        nic.remove().unwrap();

        assert!(!link.attached());
        assert!(nic.all_addresses().is_empty());
        assert!(!nic.is_in_group("224.0.0.1".parse().unwrap()));
        assert!(env.v4.endpoint(0).is_closed());
        assert!(env.v6.endpoint(0).is_closed());

        // Packets handed in after removal only bump the disabled counter.
        nic.deliver_network_packet(
            Some(mac(2)),
            None,
            IPV4_PROTOCOL,
            PacketBuffer::new(v4_packet(
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 1),
                0,
                b"late",
            )),
        );
        assert_eq!(nic.stats().disabled_rx.packets.get(), 1);
        assert!(env.v4.endpoint(0).delivered().is_empty());
    }

    #[test]
    fn test_link_local_autogeneration() {
        let env = build_env(|ctx| {
            ctx.auto_gen_ipv6_link_local = true;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        // EUI-64 of 02:00:00:00:00:01 within fe80::/64.
        assert!(has_address(&nic, "fe80::ff:fe00:1"));
        assert!(nic.is_addr_tentative("fe80::ff:fe00:1".parse().unwrap()));

        env.clock.advance(Duration::ZERO);
        env.clock.advance(Duration::from_secs(1));
        assert!(!nic.is_addr_tentative("fe80::ff:fe00:1".parse().unwrap()));
        assert_eq!(
            env.ndp_events.generated_addrs(),
            vec![AddressWithPrefix::new("fe80::ff:fe00:1".parse().unwrap(), 64)]
        );
    }

    #[test]
    fn test_no_link_local_on_loopback() {
        let env = build_env(|ctx| {
            ctx.auto_gen_ipv6_link_local = true;
        });
        let link = StubLinkEndpoint::loopback();
        let nic = Nic::new(env.ctx.clone(), 1, "lo", link, None);
        nic.enable().unwrap();

        assert!(nic.all_addresses().is_empty());
    }

    #[test]
    fn test_router_solicitation_schedule() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.enable().unwrap();

        // First RS after the solicitation delay, then one per interval,
        // up to the configured count.
        env.clock.advance(Duration::from_secs(1));
        assert_eq!(rs_probes(&link).len(), 1);
        env.clock.advance(Duration::from_secs(4));
        assert_eq!(rs_probes(&link).len(), 2);
        env.clock.advance(Duration::from_secs(4));
        assert_eq!(rs_probes(&link).len(), 3);
        env.clock.advance(Duration::from_secs(60));
        assert_eq!(rs_probes(&link).len(), 3);

        let rs = &rs_probes(&link)[0];
        assert_eq!(rs.remote_address, "ff02::2".parse::<IpAddr>().unwrap());
        assert_eq!(rs.local_address, "::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_no_router_solicitation_when_forwarding() {
        let env = build_env(|_| {});
        env.ctx.set_forwarding(true);
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.enable().unwrap();

        env.clock.advance(Duration::from_secs(30));
        assert!(rs_probes(&link).is_empty());
    }

    #[test]
    fn test_disable_stops_router_solicitation_and_dad() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        nic.enable().unwrap();

        nic.disable().unwrap();
        env.clock.advance(Duration::from_secs(30));
        assert!(ns_probes(&link).is_empty());
        assert!(rs_probes(&link).is_empty());

        // The address survives disable and runs DAD again on re-enable.
        assert!(has_address(&nic, "2001:db8::1"));
        nic.enable().unwrap();
        assert!(nic.is_addr_tentative("2001:db8::1".parse().unwrap()));
        env.clock.advance(Duration::ZERO);
        assert_eq!(ns_probes(&link).len(), 1);
    }

    #[test]
    fn test_router_and_prefix_discovery_via_ra() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        let router: Ipv6Addr = "fe80::1".parse().unwrap();
        let ra = RouterAdvertisement::new(64, 1800)
            .with_source_link_addr(mac(3))
            .with_prefix(PrefixInformation::new(
                "2001:db8:5::".parse().unwrap(),
                64,
                true,
                false,
                600,
                300,
            ));
        nic.handle_ndp_ra(router, &ra);

        let prefix = Subnet::from_addr("2001:db8:5::".parse().unwrap(), 64);
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::RouterDiscovered(router)));
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::PrefixDiscovered(prefix)));

        // Lifetimes drive invalidation.
        env.clock.advance(Duration::from_secs(600));
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::PrefixInvalidated(prefix)));
        env.clock.advance(Duration::from_secs(1200));
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::RouterInvalidated(router)));
    }

    #[test]
    fn test_ra_zero_lifetime_invalidates_router() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        let router: Ipv6Addr = "fe80::1".parse().unwrap();
        nic.handle_ndp_ra(router, &RouterAdvertisement::new(64, 1800));
        nic.handle_ndp_ra(router, &RouterAdvertisement::new(64, 0));

        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::RouterInvalidated(router)));
    }

    #[test]
    fn test_ra_ignored_while_forwarding() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();
        env.ctx.set_forwarding(true);

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &RouterAdvertisement::new(64, 1800));
        assert!(env.ndp_events.events().is_empty());
    }

    fn slaac_ra(valid: u32, preferred: u32) -> RouterAdvertisement {
        RouterAdvertisement::new(64, 1800).with_prefix(PrefixInformation::new(
            "2001:db8:1::".parse().unwrap(),
            64,
            true,
            true,
            valid,
            preferred,
        ))
    }

    #[test]
    fn test_slaac_address_lifecycle() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(600, 300));

        // EUI-64 within the advertised prefix, tentative until DAD ends.
        let addr = "2001:db8:1::ff:fe00:1";
        assert!(has_address(&nic, addr));
        assert!(nic.is_addr_tentative(addr.parse().unwrap()));

        env.clock.advance(Duration::ZERO);
        env.clock.advance(Duration::from_secs(1));
        assert!(!nic.is_addr_tentative(addr.parse().unwrap()));

        // Preferred lifetime expiry deprecates the address but keeps it.
        env.clock.advance(Duration::from_secs(300));
        let awp = AddressWithPrefix::new(addr.parse().unwrap(), 64);
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::AddrDeprecated(awp)));
        assert!(has_address(&nic, addr));
        // A deprecated address is still returned when nothing better
        // exists.
        assert_eq!(
            nic.primary_address(IPV6_PROTOCOL).unwrap().address,
            addr.parse::<IpAddr>().unwrap()
        );

        // Valid lifetime expiry invalidates it.
        env.clock.advance(Duration::from_secs(300));
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::AddrInvalidated(awp)));
        assert!(!has_address(&nic, addr));
    }

    #[test]
    fn test_slaac_refresh_extends_lifetime() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(7200, 7200));
        let addr = "2001:db8:1::ff:fe00:1";

        // Half the lifetime later a fresh RA renews the prefix.
        env.clock.advance(Duration::from_secs(3600));
        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(7200, 7200));

        // The original expiry passes without invalidating the address.
        env.clock.advance(Duration::from_secs(3601));
        assert!(has_address(&nic, addr));

        env.clock.advance(Duration::from_secs(3600));
        assert!(!has_address(&nic, addr));
    }

    #[test]
    fn test_slaac_short_refresh_clamps_to_two_hours() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(24 * 3600, 24 * 3600));
        let addr = "2001:db8:1::ff:fe00:1";

        // A hostile RA advertising a tiny valid lifetime cannot kill the
        // address sooner than two hours out.
        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(10, 10));
        env.clock.advance(Duration::from_secs(60));
        assert!(has_address(&nic, addr));

        env.clock.advance(Duration::from_secs(2 * 3600));
        assert!(!has_address(&nic, addr));
    }

    #[test]
    fn test_slaac_dad_conflict_regenerates_stable_address() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(600, 300));
        let first = "2001:db8:1::ff:fe00:1";
        assert!(has_address(&nic, first));

        nic.dup_tentative_addr_detected(first.parse().unwrap()).unwrap();

        assert!(!has_address(&nic, first));
        let generated = env.ndp_events.generated_addrs();
        assert_eq!(generated.len(), 2);
        let replacement = generated[1];
        assert_ne!(replacement.address, first.parse::<IpAddr>().unwrap());
        // Same prefix, different interface identifier.
        let prefix = Subnet::from_addr("2001:db8:1::".parse().unwrap(), 64);
        assert!(prefix.contains(replacement.address));
        assert!(has_address(&nic, &replacement.address.to_string()));
    }

    #[test]
    fn test_temporary_slaac_addresses() {
        let env = build_env(|ctx| {
            ctx.ndp_configs.auto_gen_temp_global_addresses = true;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);
        nic.enable().unwrap();

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(600, 300));

        // A stable and a temporary address were generated for the prefix.
        let generated = env.ndp_events.generated_addrs();
        assert_eq!(generated.len(), 2);
        let stable = generated[0].address;
        let temp = generated[1].address;
        assert_ne!(stable, temp);
        let prefix = Subnet::from_addr("2001:db8:1::".parse().unwrap(), 64);
        assert!(prefix.contains(temp));

        // A conflict on the still-tentative temporary address regenerates
        // a fresh one for the same prefix.
        let IpAddr::V6(temp_v6) = temp else {
            panic!("expected v6");
        };
        nic.dup_tentative_addr_detected(temp_v6).unwrap();

        let generated = env.ndp_events.generated_addrs();
        assert_eq!(generated.len(), 3);
        let replacement = generated[2].address;
        assert_ne!(replacement, temp);
        assert!(prefix.contains(replacement));
        assert!(!has_address(&nic, &temp.to_string()));
        assert!(has_address(&nic, &replacement.to_string()));

        // Temporary addresses are preferred for new connections once DAD
        // completes.
        env.clock.advance(Duration::ZERO);
        env.clock.advance(Duration::from_secs(1));
        let primaries = nic.primary_addresses();
        let v6_first = primaries
            .iter()
            .find(|a| a.protocol == IPV6_PROTOCOL)
            .unwrap();
        assert_eq!(v6_first.address_with_prefix.address, replacement);
    }

    #[test]
    fn test_become_router_cleans_host_state_but_keeps_link_local() {
        let env = build_env(|ctx| {
            ctx.auto_gen_ipv6_link_local = true;
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);
        nic.enable().unwrap();

        nic.handle_ndp_ra("fe80::1".parse().unwrap(), &slaac_ra(600, 300));
        assert!(has_address(&nic, "2001:db8:1::ff:fe00:1"));
        assert!(has_address(&nic, "fe80::ff:fe00:1"));

        env.ctx.set_forwarding(true);
        nic.become_ipv6_router();
        nic.become_ipv6_router();

        // Host-learned state is gone; the link-local address survives.
        assert!(!has_address(&nic, "2001:db8:1::ff:fe00:1"));
        assert!(has_address(&nic, "fe80::ff:fe00:1"));
        assert!(env
            .ndp_events
            .events()
            .contains(&NdpEvent::RouterInvalidated("fe80::1".parse().unwrap())));

        // No more solicitations as a router.
        link.clear_written();
        env.clock.advance(Duration::from_secs(30));
        assert!(rs_probes(&link).is_empty());

        // Back to host: solicitation resumes.
        env.ctx.set_forwarding(false);
        nic.become_ipv6_host();
        env.clock.advance(Duration::from_secs(1));
        assert_eq!(rs_probes(&link).len(), 1);
    }

    #[test]
    fn test_group_membership() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);

        let group: IpAddr = "224.0.0.251".parse().unwrap();
        assert!(!nic.is_in_group(group));

        nic.join_group(IPV4_PROTOCOL, group).unwrap();
        nic.join_group(IPV4_PROTOCOL, group).unwrap();
        assert!(nic.is_in_group(group));
        assert_eq!(env.v4.endpoint(0).group_count(group), 2);

        nic.leave_group(IPV4_PROTOCOL, group).unwrap();
        assert!(nic.is_in_group(group));
        nic.leave_group(IPV4_PROTOCOL, group).unwrap();
        assert!(!nic.is_in_group(group));

        assert!(matches!(
            nic.leave_group(IPV4_PROTOCOL, group),
            Err(Error::BadLocalAddress(_))
        ));
        assert!(matches!(
            nic.join_group(0x9999, group),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn test_neighbor_operations_require_cache() {
        // Without a resolver-capable link there is no neighbor cache.
        let env = build_env(|ctx| {
            ctx.use_neighbor_cache = true;
        });
        let nic_lo = Nic::new(env.ctx.clone(), 1, "lo", StubLinkEndpoint::loopback(), None);
        assert!(matches!(nic_lo.neighbors(), Err(Error::NotSupported)));
        assert!(matches!(
            nic_lo.add_static_neighbor("10.0.0.9".parse().unwrap(), mac(9)),
            Err(Error::NotSupported)
        ));
        assert!(matches!(nic_lo.clear_neighbors(), Err(Error::NotSupported)));
        assert!(matches!(nic_lo.nud_configs(), Err(Error::NotSupported)));

        let nic = Nic::new(
            env.ctx.clone(),
            2,
            "eth0",
            StubLinkEndpoint::ethernet(mac(1)),
            None,
        );
        let addr: IpAddr = "10.0.0.9".parse().unwrap();
        nic.add_static_neighbor(addr, mac(9)).unwrap();
        assert_eq!(nic.neighbors().unwrap().len(), 1);

        nic.remove_neighbor(addr).unwrap();
        assert!(matches!(
            nic.remove_neighbor(addr),
            Err(Error::BadAddress(_))
        ));

        nic.add_static_neighbor(addr, mac(9)).unwrap();
        nic.clear_neighbors().unwrap();
        assert!(nic.neighbors().unwrap().is_empty());

        let mut configs = nic.nud_configs().unwrap();
        configs.max_multicast_probes = 5;
        nic.set_nud_configs(configs).unwrap();
        assert_eq!(nic.nud_configs().unwrap().max_multicast_probes, 5);
    }

    #[test]
    fn test_no_neighbor_cache_without_stack_opt_in() {
        let env = build_env(|_| {});
        let nic = Nic::new(
            env.ctx.clone(),
            1,
            "eth0",
            StubLinkEndpoint::ethernet(mac(1)),
            None,
        );
        assert!(nic.neighbor_cache().is_none());
        assert!(matches!(nic.neighbors(), Err(Error::NotSupported)));
    }

    #[test]
    fn test_transport_delivery_paths() {
        let demux = RecordingDemux::new();
        let udp = StubTransportProtocol::new(UDP_TRANSPORT);
        let demux_clone = demux.clone();
        let udp_clone = udp.clone();
        let env = build_env(move |ctx| {
            ctx.set_demux(demux_clone);
            ctx.add_transport_protocol(udp_clone, None);
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);

        let route = Route::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            None,
            None,
            None,
            None,
        );

        // Ports 0x0102 -> 0x0304, then payload.
        let pkt = PacketBuffer::new(vec![1, 2, 3, 4, 0xde, 0xad]);
        nic.deliver_transport_packet(&route, UDP_TRANSPORT, pkt);

        // Raw sockets always come first.
        assert_eq!(demux.raw.lock().unwrap().as_slice(), &[UDP_TRANSPORT]);

        let expected_id = TransportEndpointId {
            local_port: 0x0304,
            local_address: "10.0.0.1".parse().unwrap(),
            remote_port: 0x0102,
            remote_address: "10.0.0.2".parse().unwrap(),
        };
        assert_eq!(demux.delivered.lock().unwrap().as_slice(), &[expected_id]);

        // Nobody consumed it: the protocol's unknown-destination handler
        // ran and the packet was counted as malformed.
        assert_eq!(udp.unknown_calls.lock().unwrap().as_slice(), &[expected_id]);
        assert_eq!(env.ctx.stats.malformed_rcvd_packets.get(), 1);

        // A consuming demultiplexer short-circuits the fallbacks.
        demux.consume.store(true, std::sync::atomic::Ordering::SeqCst);
        let pkt = PacketBuffer::new(vec![1, 2, 3, 4]);
        nic.deliver_transport_packet(&route, UDP_TRANSPORT, pkt);
        assert_eq!(udp.unknown_calls.lock().unwrap().len(), 1);
        assert_eq!(env.ctx.stats.malformed_rcvd_packets.get(), 1);

        // Unknown transport protocol.
        let pkt = PacketBuffer::new(vec![1, 2, 3, 4]);
        nic.deliver_transport_packet(&route, 99, pkt);
        assert_eq!(env.ctx.stats.unknown_protocol_rcvd_packets.get(), 1);

        // Too short for even the minimum transport header.
        let pkt = PacketBuffer::new(vec![1]);
        nic.deliver_transport_packet(&route, UDP_TRANSPORT, pkt);
        assert_eq!(env.ctx.stats.malformed_rcvd_packets.get(), 2);
    }

    #[test]
    fn test_transport_default_handler_runs_before_unknown_destination() {
        let demux = RecordingDemux::new();
        let udp = StubTransportProtocol::new(UDP_TRANSPORT);
        let handled = Arc::new(Mutex::new(Vec::new()));
        let demux_clone = demux.clone();
        let udp_clone = udp.clone();
        let handled_clone = handled.clone();
        let env = build_env(move |ctx| {
            ctx.set_demux(demux_clone);
            ctx.add_transport_protocol(
                udp_clone,
                Some(Box::new(move |_route, id, _pkt| {
                    handled_clone.lock().unwrap().push(*id);
                    true
                })),
            );
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);

        let route = Route::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            None,
            None,
            None,
            None,
        );
        nic.deliver_transport_packet(&route, UDP_TRANSPORT, PacketBuffer::new(vec![1, 2, 3, 4]));

        assert_eq!(handled.lock().unwrap().len(), 1);
        assert!(udp.unknown_calls.lock().unwrap().is_empty());
        assert_eq!(env.ctx.stats.malformed_rcvd_packets.get(), 0);
    }

    #[test]
    fn test_transport_control_delivery() {
        let demux = RecordingDemux::new();
        let udp = StubTransportProtocol::new(UDP_TRANSPORT);
        let demux_clone = demux.clone();
        let udp_clone = udp.clone();
        let env = build_env(move |ctx| {
            ctx.set_demux(demux_clone);
            ctx.add_transport_protocol(udp_clone, None);
        });
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link, None);

        let local: IpAddr = "10.0.0.1".parse().unwrap();
        let remote: IpAddr = "10.0.0.2".parse().unwrap();

        // First 8 bytes of the embedded payload carry the ports.
        let pkt = PacketBuffer::new(vec![1, 2, 3, 4, 0, 0, 0, 0, 9]);
        nic.deliver_transport_control_packet(
            local,
            remote,
            IPV4_PROTOCOL,
            UDP_TRANSPORT,
            ControlType::PortUnreachable,
            0,
            pkt,
        );

        let control = demux.control.lock().unwrap();
        assert_eq!(control.len(), 1);
        assert_eq!(control[0].0, ControlType::PortUnreachable);
        assert_eq!(
            control[0].1,
            TransportEndpointId {
                local_port: 0x0102,
                local_address: local,
                remote_port: 0x0304,
                remote_address: remote,
            }
        );

        // A packet too short for the ports is silently ignored.
        drop(control);
        let pkt = PacketBuffer::new(vec![1, 2, 3]);
        nic.deliver_transport_control_packet(
            local,
            remote,
            IPV4_PROTOCOL,
            UDP_TRANSPORT,
            ControlType::PortUnreachable,
            0,
            pkt,
        );
        assert_eq!(demux.control.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_set_ndp_configs_validates() {
        let env = build_env(|_| {});
        let link = StubLinkEndpoint::ethernet(mac(1));
        let nic = Nic::new(env.ctx.clone(), 1, "eth0", link.clone(), None);

        let mut configs = crate::config::NdpConfigurations::default();
        configs.dup_addr_detect_transmits = 0;
        configs.retransmit_timer = Duration::ZERO; // invalid, clamped
        nic.set_ndp_configs(configs);
        nic.enable().unwrap();

        // With zero transmits, DAD resolves immediately.
        nic.add_address(v6_addr("2001:db8::1/64"), PrimaryEndpointBehavior::CanBePrimary)
            .unwrap();
        assert!(!nic.is_addr_tentative("2001:db8::1".parse().unwrap()));
        assert!(ns_probes(&link).is_empty());
    }
}
