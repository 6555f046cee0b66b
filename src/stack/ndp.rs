//! Neighbor Discovery state (RFC 4861, 4862, 4941, 7217)
//!
//! Per-interface DAD, SLAAC (stable and temporary addresses), and
//! router/prefix discovery. All state lives inside the interface's guarded
//! inner struct; every operation here runs with the interface lock held in
//! exclusive mode. Timers re-enter the interface through the stack clock,
//! which never fires a callback while the lock is held.

use crate::config::NdpConfigurations;
use crate::protocol::{
    all_routers_multicast, icmpv6, ipv6_link_local_subnet, is_ipv6_unicast,
    solicited_node_multicast, AddressWithPrefix, LinkAddr, Subnet, IPV6_PROTOCOL,
};
use crate::stack::address_table::{
    AddressConfigType, AddressKind, PrimaryEndpointBehavior,
};
use crate::stack::context::TimerHandle;
use crate::stack::nic::{Nic, NicId, NicInner};
use crate::stack::packet::PacketBuffer;
use crate::stack::referenced::ReferencedEndpoint;
use crate::stack::route::Route;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Most default routers learned from RAs before further ones are ignored
const MAX_DISCOVERED_DEFAULT_ROUTERS: usize = 10;

/// Most on-link prefixes learned from RAs before further ones are ignored
const MAX_DISCOVERED_ON_LINK_PREFIXES: usize = 10;

/// How many times address generation retries after a collision or a DAD
/// conflict before the prefix is given up on
const MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS: u8 = 10;

/// RFC 4862 section 5.5.3 e): a received valid lifetime below two hours
/// cannot shorten an address's remaining lifetime below two hours.
const MIN_PREFIX_VALID_LIFETIME_FOR_UPDATE: Duration = Duration::from_secs(2 * 60 * 60);

/// Observer of Neighbor Discovery events.
///
/// Callbacks run with the interface lock held and must not call back into
/// the interface.
pub trait NdpDispatcher: Send + Sync {
    fn on_duplicate_address_detection_status(
        &self,
        _nic: NicId,
        _addr: Ipv6Addr,
        _resolved: bool,
    ) {
    }
    fn on_default_router_discovered(&self, _nic: NicId, _addr: Ipv6Addr) {}
    fn on_default_router_invalidated(&self, _nic: NicId, _addr: Ipv6Addr) {}
    fn on_on_link_prefix_discovered(&self, _nic: NicId, _prefix: Subnet) {}
    fn on_on_link_prefix_invalidated(&self, _nic: NicId, _prefix: Subnet) {}
    fn on_auto_gen_address(&self, _nic: NicId, _addr: AddressWithPrefix) {}
    fn on_auto_gen_address_deprecated(&self, _nic: NicId, _addr: AddressWithPrefix) {}
    fn on_auto_gen_address_invalidated(&self, _nic: NicId, _addr: AddressWithPrefix) {}
}

/// Timer expirations re-entering the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NdpTimerEvent {
    DadTick(Ipv6Addr),
    RouterSolicitTick,
    RouterInvalidated(Ipv6Addr),
    OnLinkPrefixInvalidated(Subnet),
    SlaacPrefixDeprecated(Subnet),
    SlaacPrefixInvalidated(Subnet),
    TempAddrDeprecated(Subnet, Ipv6Addr),
    TempAddrInvalidated(Subnet, Ipv6Addr),
    TempAddrRegen(Subnet),
}

struct DadState {
    remaining: u8,
    timer: TimerHandle,
    ref_: ReferencedEndpoint,
}

struct DefaultRouterState {
    invalidation_timer: TimerHandle,
}

struct OnLinkPrefixState {
    invalidation_timer: Option<TimerHandle>,
}

#[derive(Default)]
struct TempSlaacAddrState {
    deprecation_timer: Option<TimerHandle>,
    invalidation_timer: Option<TimerHandle>,
    regen_timer: Option<TimerHandle>,
}

impl TempSlaacAddrState {
    fn cancel_timers(&self) {
        if let Some(t) = &self.deprecation_timer {
            t.cancel();
        }
        if let Some(t) = &self.invalidation_timer {
            t.cancel();
        }
        if let Some(t) = &self.regen_timer {
            t.cancel();
        }
    }
}

struct SlaacPrefixState {
    deprecation_timer: Option<TimerHandle>,
    invalidation_timer: Option<TimerHandle>,
    /// None means infinite
    valid_until: Option<Instant>,
    /// None means infinite
    preferred_until: Option<Instant>,
    generation_attempts: u8,
    stable_addr: Option<Ipv6Addr>,
    temp_addrs: HashMap<Ipv6Addr, TempSlaacAddrState>,
    temp_generation_attempts: u8,
}

impl SlaacPrefixState {
    fn cancel_timers(&self) {
        if let Some(t) = &self.deprecation_timer {
            t.cancel();
        }
        if let Some(t) = &self.invalidation_timer {
            t.cancel();
        }
        for temp in self.temp_addrs.values() {
            temp.cancel_timers();
        }
    }
}

struct RouterSolicitState {
    remaining: u8,
    timer: TimerHandle,
}

/// Per-interface Neighbor Discovery state
pub(crate) struct NdpState {
    pub(crate) configs: NdpConfigurations,
    dad: HashMap<Ipv6Addr, DadState>,
    default_routers: HashMap<Ipv6Addr, DefaultRouterState>,
    on_link_prefixes: HashMap<Subnet, OnLinkPrefixState>,
    slaac_prefixes: HashMap<Subnet, SlaacPrefixState>,
    router_solicit: Option<RouterSolicitState>,
    /// Monotonic counter mixed into temporary interface identifiers
    temp_iid_counter: u64,
}

impl NdpState {
    pub(crate) fn new(configs: NdpConfigurations) -> Self {
        Self {
            configs,
            dad: HashMap::new(),
            default_routers: HashMap::new(),
            on_link_prefixes: HashMap::new(),
            slaac_prefixes: HashMap::new(),
            router_solicit: None,
            temp_iid_counter: 0,
        }
    }

}

fn schedule_ndp_event(nic: &Nic, delay: Duration, ev: NdpTimerEvent) -> TimerHandle {
    let weak = nic.downgrade();
    nic.stack().clock().schedule(
        delay,
        Box::new(move || {
            if let Some(nic) = weak.upgrade() {
                nic.ndp_timer_fired(ev);
            }
        }),
    )
}

/// Lifetime field from a Router Advertisement; all-ones means infinite.
fn ra_lifetime(secs: u32) -> Option<Duration> {
    if secs == u32::MAX {
        None
    } else {
        Some(Duration::from_secs(secs as u64))
    }
}

impl NicInner {
    /// Start Duplicate Address Detection for a tentative IPv6 unicast
    /// address. Takes ownership of the handle; it is released when DAD
    /// completes or is stopped.
    pub(crate) fn ndp_start_dad(
        &mut self,
        nic: &Nic,
        ref_: ReferencedEndpoint,
    ) -> Result<()> {
        let IpAddr::V6(addr) = ref_.address() else {
            return Err(Error::NotSupported);
        };
        if !is_ipv6_unicast(IpAddr::V6(addr)) {
            return Err(Error::NotSupported);
        }
        if ref_.kind() != AddressKind::PermanentTentative {
            return Err(Error::InvalidEndpointState);
        }
        if self.ndp.dad.contains_key(&addr) {
            return Ok(());
        }

        let transmits = self.ndp.configs.dup_addr_detect_transmits;
        if transmits == 0 {
            ref_.set_kind(AddressKind::Permanent);
            notify_dad_status(nic, addr, true);
            return Ok(());
        }

        debug!(nic = nic.name(), %addr, transmits, "starting DAD");
        let timer = schedule_ndp_event(nic, Duration::ZERO, NdpTimerEvent::DadTick(addr));
        self.ndp.dad.insert(
            addr,
            DadState {
                remaining: transmits,
                timer,
                ref_,
            },
        );
        Ok(())
    }

    /// Stop a running DAD process, releasing its address reference.
    pub(crate) fn ndp_stop_dad(&mut self, addr: Ipv6Addr) {
        if let Some(state) = self.ndp.dad.remove(&addr) {
            state.timer.cancel();
        }
    }

    fn dad_tick(&mut self, nic: &Nic, addr: Ipv6Addr) {
        let Some(state) = self.ndp.dad.get_mut(&addr) else {
            return;
        };

        if state.remaining > 0 {
            nic.send_dad_probe(addr);
            state.remaining -= 1;
            state.timer = schedule_ndp_event(
                nic,
                self.ndp.configs.retransmit_timer,
                NdpTimerEvent::DadTick(addr),
            );
            return;
        }

        // All probes went unanswered: the address is unique.
        let state = self.ndp.dad.remove(&addr).unwrap();
        state.ref_.set_kind(AddressKind::Permanent);
        debug!(nic = nic.name(), %addr, "DAD resolved");
        notify_dad_status(nic, addr, true);
    }

    /// Begin router solicitation. Only hosts solicit; the lifecycle layer
    /// never calls this while the stack forwards.
    pub(crate) fn ndp_start_soliciting_routers(&mut self, nic: &Nic) {
        if self.ndp.router_solicit.is_some() {
            return;
        }
        let remaining = self.ndp.configs.max_rtr_solicitations;
        if remaining == 0 {
            return;
        }

        trace!(nic = nic.name(), "starting router solicitation");
        let timer = schedule_ndp_event(
            nic,
            self.ndp.configs.max_rtr_solicitation_delay,
            NdpTimerEvent::RouterSolicitTick,
        );
        self.ndp.router_solicit = Some(RouterSolicitState { remaining, timer });
    }

    pub(crate) fn ndp_stop_soliciting_routers(&mut self) {
        if let Some(state) = self.ndp.router_solicit.take() {
            state.timer.cancel();
        }
    }

    fn router_solicit_tick(&mut self, nic: &Nic) {
        let Some(state) = self.ndp.router_solicit.as_mut() else {
            return;
        };
        nic.send_router_solicitation();
        state.remaining -= 1;
        if state.remaining > 0 {
            state.timer = schedule_ndp_event(
                nic,
                self.ndp.configs.rtr_solicitation_interval,
                NdpTimerEvent::RouterSolicitTick,
            );
        } else {
            self.ndp.router_solicit = None;
        }
    }

    /// Process a received Router Advertisement.
    pub(crate) fn ndp_handle_ra(
        &mut self,
        nic: &Nic,
        src: Ipv6Addr,
        ra: &icmpv6::RouterAdvertisement,
    ) {
        // Routers do not learn from RAs.
        if !self.ndp.configs.handle_ras || nic.stack().forwarding() {
            return;
        }

        trace!(
            nic = nic.name(),
            router = %src,
            lifetime = ra.router_lifetime,
            prefixes = ra.prefixes.len(),
            "handling RA"
        );

        if self.ndp.configs.discover_default_routers {
            self.update_default_router(nic, src, ra.router_lifetime);
        }

        for pi in &ra.prefixes {
            let subnet = Subnet::from_addr(IpAddr::V6(pi.prefix), pi.prefix_length);
            if subnet == ipv6_link_local_subnet() || pi.prefix.is_multicast() {
                continue;
            }

            if self.ndp.configs.discover_on_link_prefixes && pi.on_link_flag {
                self.update_on_link_prefix(nic, subnet, ra_lifetime(pi.valid_lifetime));
            }

            // RFC 4862 section 5.5.3 c): ignore options whose preferred
            // lifetime exceeds the valid lifetime.
            if self.ndp.configs.auto_gen_global_addresses
                && pi.autonomous_flag
                && pi.prefix_length == 64
                && pi.preferred_lifetime <= pi.valid_lifetime
            {
                self.ndp_do_slaac(
                    nic,
                    subnet,
                    ra_lifetime(pi.valid_lifetime),
                    ra_lifetime(pi.preferred_lifetime),
                );
            }
        }
    }

    fn update_default_router(&mut self, nic: &Nic, src: Ipv6Addr, lifetime_secs: u16) {
        if lifetime_secs == 0 {
            self.invalidate_default_router(nic, src);
            return;
        }

        let lifetime = Duration::from_secs(lifetime_secs as u64);
        if let Some(state) = self.ndp.default_routers.get_mut(&src) {
            state.invalidation_timer.cancel();
            state.invalidation_timer =
                schedule_ndp_event(nic, lifetime, NdpTimerEvent::RouterInvalidated(src));
            return;
        }

        if self.ndp.default_routers.len() >= MAX_DISCOVERED_DEFAULT_ROUTERS {
            return;
        }

        debug!(nic = nic.name(), router = %src, "default router discovered");
        let timer = schedule_ndp_event(nic, lifetime, NdpTimerEvent::RouterInvalidated(src));
        self.ndp.default_routers.insert(
            src,
            DefaultRouterState {
                invalidation_timer: timer,
            },
        );
        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_default_router_discovered(nic.id(), src);
        }
    }

    fn invalidate_default_router(&mut self, nic: &Nic, src: Ipv6Addr) {
        if let Some(state) = self.ndp.default_routers.remove(&src) {
            state.invalidation_timer.cancel();
            debug!(nic = nic.name(), router = %src, "default router invalidated");
            if let Some(disp) = nic.stack().ndp_dispatcher() {
                disp.on_default_router_invalidated(nic.id(), src);
            }
        }
    }

    fn update_on_link_prefix(
        &mut self,
        nic: &Nic,
        subnet: Subnet,
        valid: Option<Duration>,
    ) {
        match valid {
            Some(d) if d.is_zero() => {
                self.invalidate_on_link_prefix(nic, subnet);
            }
            _ => {
                if let Some(state) = self.ndp.on_link_prefixes.get_mut(&subnet) {
                    if let Some(t) = &state.invalidation_timer {
                        t.cancel();
                    }
                    state.invalidation_timer = valid.map(|d| {
                        schedule_ndp_event(nic, d, NdpTimerEvent::OnLinkPrefixInvalidated(subnet))
                    });
                    return;
                }

                if self.ndp.on_link_prefixes.len() >= MAX_DISCOVERED_ON_LINK_PREFIXES {
                    return;
                }

                debug!(nic = nic.name(), prefix = %subnet, "on-link prefix discovered");
                let timer = valid.map(|d| {
                    schedule_ndp_event(nic, d, NdpTimerEvent::OnLinkPrefixInvalidated(subnet))
                });
                self.ndp.on_link_prefixes.insert(
                    subnet,
                    OnLinkPrefixState {
                        invalidation_timer: timer,
                    },
                );
                if let Some(disp) = nic.stack().ndp_dispatcher() {
                    disp.on_on_link_prefix_discovered(nic.id(), subnet);
                }
            }
        }
    }

    fn invalidate_on_link_prefix(&mut self, nic: &Nic, subnet: Subnet) {
        if let Some(state) = self.ndp.on_link_prefixes.remove(&subnet) {
            if let Some(t) = &state.invalidation_timer {
                t.cancel();
            }
            if let Some(disp) = nic.stack().ndp_dispatcher() {
                disp.on_on_link_prefix_invalidated(nic.id(), subnet);
            }
        }
    }

    /// Create or refresh a SLAAC prefix with the given lifetimes
    /// (None = infinite).
    pub(crate) fn ndp_do_slaac(
        &mut self,
        nic: &Nic,
        prefix: Subnet,
        valid: Option<Duration>,
        preferred: Option<Duration>,
    ) {
        if self.ndp.slaac_prefixes.contains_key(&prefix) {
            self.refresh_slaac_prefix(nic, prefix, valid, preferred);
            return;
        }

        // A new prefix with no valid lifetime generates nothing.
        if valid.is_some_and(|d| d.is_zero()) {
            return;
        }

        let Some((addr, attempt)) = self.generate_stable_slaac_addr(nic, prefix, 0) else {
            return;
        };

        let deprecated = preferred.is_some_and(|d| d.is_zero());
        let ref_ = match self.add_address_locked(
            nic,
            IPV6_PROTOCOL,
            AddressWithPrefix::new(IpAddr::V6(addr), 64),
            PrimaryEndpointBehavior::CanBePrimary,
            AddressKind::Permanent,
            AddressConfigType::Slaac,
            deprecated,
        ) {
            Ok(r) => r,
            Err(err) => {
                warn!(nic = nic.name(), %addr, %err, "SLAAC address add failed");
                return;
            }
        };
        drop(ref_);

        debug!(nic = nic.name(), prefix = %prefix, %addr, "SLAAC address generated");

        let now = nic.stack().clock().now();
        let deprecation_timer = match preferred {
            Some(d) if !d.is_zero() => Some(schedule_ndp_event(
                nic,
                d,
                NdpTimerEvent::SlaacPrefixDeprecated(prefix),
            )),
            _ => None,
        };
        let invalidation_timer = valid.map(|d| {
            schedule_ndp_event(nic, d, NdpTimerEvent::SlaacPrefixInvalidated(prefix))
        });

        self.ndp.slaac_prefixes.insert(
            prefix,
            SlaacPrefixState {
                deprecation_timer,
                invalidation_timer,
                valid_until: valid.map(|d| now + d),
                preferred_until: preferred.map(|d| now + d),
                generation_attempts: attempt,
                stable_addr: Some(addr),
                temp_addrs: HashMap::new(),
                temp_generation_attempts: 0,
            },
        );

        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_auto_gen_address(nic.id(), AddressWithPrefix::new(IpAddr::V6(addr), 64));
        }

        if self.ndp.configs.auto_gen_temp_global_addresses
            && prefix != ipv6_link_local_subnet()
            && !preferred.is_some_and(|d| d.is_zero())
        {
            self.generate_temp_slaac_addr(nic, prefix);
        }
    }

    fn refresh_slaac_prefix(
        &mut self,
        nic: &Nic,
        prefix: Subnet,
        valid: Option<Duration>,
        preferred: Option<Duration>,
    ) {
        let now = nic.stack().clock().now();
        let Some(state) = self.ndp.slaac_prefixes.get_mut(&prefix) else {
            return;
        };

        // RFC 4862 section 5.5.3 e): a received lifetime of at least two
        // hours, or one extending the remaining lifetime, applies as-is;
        // anything shorter clamps to two hours.
        let effective_valid = match valid {
            None => None,
            Some(received) => {
                let remaining = state.valid_until.map(|u| u.saturating_duration_since(now));
                if received >= MIN_PREFIX_VALID_LIFETIME_FOR_UPDATE
                    || remaining.is_some_and(|r| received > r)
                {
                    Some(received)
                } else if remaining.is_none_or(|r| r > MIN_PREFIX_VALID_LIFETIME_FOR_UPDATE) {
                    Some(MIN_PREFIX_VALID_LIFETIME_FOR_UPDATE)
                } else {
                    // Remaining lifetime is already at most two hours; the
                    // advertisement is ignored.
                    state.valid_until.map(|u| u.saturating_duration_since(now))
                }
            }
        };

        if let Some(t) = &state.invalidation_timer {
            t.cancel();
        }
        state.invalidation_timer = effective_valid.map(|d| {
            schedule_ndp_event(nic, d, NdpTimerEvent::SlaacPrefixInvalidated(prefix))
        });
        state.valid_until = effective_valid.map(|d| now + d);

        if let Some(t) = &state.deprecation_timer {
            t.cancel();
        }
        let deprecate_now = preferred.is_some_and(|d| d.is_zero());
        state.deprecation_timer = match preferred {
            Some(d) if !d.is_zero() => Some(schedule_ndp_event(
                nic,
                d,
                NdpTimerEvent::SlaacPrefixDeprecated(prefix),
            )),
            _ => None,
        };
        state.preferred_until = preferred.map(|d| now + d);

        let stable_addr = state.stable_addr;
        if let Some(addr) = stable_addr {
            self.set_slaac_addr_deprecated(nic, IpAddr::V6(addr), deprecate_now);
        }
    }

    fn set_slaac_addr_deprecated(&mut self, nic: &Nic, addr: IpAddr, deprecated: bool) {
        let Some(ep) = nic.network_endpoint(IPV6_PROTOCOL) else {
            return;
        };
        if let Some(entry) = ep.get_endpoint(addr) {
            let was = entry.deprecated();
            entry.set_deprecated(deprecated);
            if deprecated && !was {
                if let Some(disp) = nic.stack().ndp_dispatcher() {
                    disp.on_auto_gen_address_deprecated(nic.id(), entry.address_with_prefix());
                }
            }
            entry.dec_ref();
        }
    }

    /// Pick a stable address for the prefix, skipping collisions with
    /// already-assigned addresses. The first attempt derives the interface
    /// identifier from the link address (EUI-64); regenerations use opaque
    /// identifiers. Returns the address and the attempt that produced it.
    fn generate_stable_slaac_addr(
        &mut self,
        nic: &Nic,
        prefix: Subnet,
        first_attempt: u8,
    ) -> Option<(Ipv6Addr, u8)> {
        let ep = nic.network_endpoint(IPV6_PROTOCOL)?;
        let mut attempt = first_attempt;
        while attempt <= MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS {
            let addr = if attempt == 0 {
                eui64_addr(prefix, nic.link_endpoint().link_address())
            } else {
                opaque_iid_addr(
                    prefix,
                    &nic.stack().opaque_iid_secret,
                    nic.name(),
                    attempt as u64,
                )
            };
            if !ep.has_address(IpAddr::V6(addr)) {
                return Some((addr, attempt));
            }
            attempt += 1;
        }
        warn!(nic = nic.name(), prefix = %prefix, "SLAAC address generation exhausted");
        None
    }

    fn generate_temp_slaac_addr(&mut self, nic: &Nic, prefix: Subnet) -> bool {
        let now = nic.stack().clock().now();
        let configs = self.ndp.configs.clone();

        let Some(state) = self.ndp.slaac_prefixes.get(&prefix) else {
            return false;
        };
        if state.temp_generation_attempts > MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS {
            return false;
        }

        // Temporary lifetimes are the prefix's remaining lifetimes capped
        // by configuration.
        let valid = cap_lifetime(
            state.valid_until.map(|u| u.saturating_duration_since(now)),
            configs.max_temp_addr_valid_lifetime,
        );
        let preferred = cap_lifetime(
            state
                .preferred_until
                .map(|u| u.saturating_duration_since(now)),
            configs.max_temp_addr_preferred_lifetime,
        );

        // Not worth generating an address that would deprecate before a
        // replacement could be ready.
        if preferred <= configs.regen_advance_duration || valid.is_zero() {
            return false;
        }

        let Some(ep) = nic.network_endpoint(IPV6_PROTOCOL) else {
            return false;
        };
        self.ndp.temp_iid_counter += 1;
        let mut addr = temp_iid_addr(
            prefix,
            &nic.stack().opaque_iid_secret,
            self.ndp.temp_iid_counter,
        );
        let mut tries = 0;
        while ep.has_address(IpAddr::V6(addr)) && tries < MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS {
            self.ndp.temp_iid_counter += 1;
            addr = temp_iid_addr(
                prefix,
                &nic.stack().opaque_iid_secret,
                self.ndp.temp_iid_counter,
            );
            tries += 1;
        }

        let ref_ = match self.add_address_locked(
            nic,
            IPV6_PROTOCOL,
            AddressWithPrefix::new(IpAddr::V6(addr), 64),
            PrimaryEndpointBehavior::FirstPrimary,
            AddressKind::Permanent,
            AddressConfigType::SlaacTemp,
            false,
        ) {
            Ok(r) => r,
            Err(err) => {
                warn!(nic = nic.name(), %addr, %err, "temporary SLAAC address add failed");
                return false;
            }
        };
        drop(ref_);

        debug!(nic = nic.name(), prefix = %prefix, %addr, "temporary SLAAC address generated");

        let temp_state = TempSlaacAddrState {
            deprecation_timer: Some(schedule_ndp_event(
                nic,
                preferred,
                NdpTimerEvent::TempAddrDeprecated(prefix, addr),
            )),
            invalidation_timer: Some(schedule_ndp_event(
                nic,
                valid,
                NdpTimerEvent::TempAddrInvalidated(prefix, addr),
            )),
            regen_timer: Some(schedule_ndp_event(
                nic,
                preferred - configs.regen_advance_duration,
                NdpTimerEvent::TempAddrRegen(prefix),
            )),
        };

        if let Some(state) = self.ndp.slaac_prefixes.get_mut(&prefix) {
            state.temp_addrs.insert(addr, temp_state);
        }

        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_auto_gen_address(nic.id(), AddressWithPrefix::new(IpAddr::V6(addr), 64));
        }
        true
    }

    /// Regenerate the stable address of a SLAAC prefix after a DAD
    /// conflict removed the previous one.
    pub(crate) fn ndp_regenerate_slaac_addr(&mut self, nic: &Nic, prefix: Subnet) {
        let Some(state) = self.ndp.slaac_prefixes.get(&prefix) else {
            return;
        };
        let next_attempt = state.generation_attempts.saturating_add(1);
        if next_attempt > MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS {
            self.ndp_invalidate_slaac_prefix(nic, prefix);
            return;
        }

        let Some((addr, attempt)) = self.generate_stable_slaac_addr(nic, prefix, next_attempt)
        else {
            self.ndp_invalidate_slaac_prefix(nic, prefix);
            return;
        };

        match self.add_address_locked(
            nic,
            IPV6_PROTOCOL,
            AddressWithPrefix::new(IpAddr::V6(addr), 64),
            PrimaryEndpointBehavior::CanBePrimary,
            AddressKind::Permanent,
            AddressConfigType::Slaac,
            false,
        ) {
            Ok(ref_) => drop(ref_),
            Err(err) => {
                warn!(nic = nic.name(), %addr, %err, "SLAAC regeneration failed");
                return;
            }
        }

        debug!(nic = nic.name(), prefix = %prefix, %addr, "SLAAC address regenerated");
        if let Some(state) = self.ndp.slaac_prefixes.get_mut(&prefix) {
            state.stable_addr = Some(addr);
            state.generation_attempts = attempt;
        }
        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_auto_gen_address(nic.id(), AddressWithPrefix::new(IpAddr::V6(addr), 64));
        }
    }

    /// Regenerate a temporary address after a DAD conflict. The attempt
    /// counter is only reset when the regeneration is not conflict-driven.
    pub(crate) fn ndp_regenerate_temp_slaac_addr(
        &mut self,
        nic: &Nic,
        prefix: Subnet,
        reset_gen_attempts: bool,
    ) {
        if let Some(state) = self.ndp.slaac_prefixes.get_mut(&prefix) {
            if reset_gen_attempts {
                state.temp_generation_attempts = 0;
            } else {
                state.temp_generation_attempts = state.temp_generation_attempts.saturating_add(1);
            }
        } else {
            return;
        }
        self.generate_temp_slaac_addr(nic, prefix);
    }

    fn ndp_invalidate_slaac_prefix(&mut self, nic: &Nic, prefix: Subnet) {
        let Some(state) = self.ndp.slaac_prefixes.remove(&prefix) else {
            return;
        };
        state.cancel_timers();

        if let Some(addr) = state.stable_addr {
            self.remove_slaac_generated_addr(nic, IpAddr::V6(addr));
        }
        for addr in state.temp_addrs.keys() {
            self.remove_slaac_generated_addr(nic, IpAddr::V6(*addr));
        }
    }

    /// Remove an address generated by SLAAC without re-entering prefix
    /// invalidation (its state has already been taken down).
    fn remove_slaac_generated_addr(&mut self, nic: &Nic, addr: IpAddr) {
        let Some(ep) = nic.network_endpoint(IPV6_PROTOCOL) else {
            return;
        };
        let Some(entry) = ep.get_endpoint(addr) else {
            return;
        };
        let addr_wp = entry.address_with_prefix();
        let ref_ = nic.nep_to_ref(IPV6_PROTOCOL, ep.clone(), entry);
        if let IpAddr::V6(v6) = addr {
            self.ndp_stop_dad(v6);
        }
        ref_.expire();

        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_auto_gen_address_invalidated(nic.id(), addr_wp);
        }
    }

    /// Clean up learned and generated state. With `host_only`, the
    /// link-local SLAAC prefix survives; everything learned from routers
    /// goes away either way.
    pub(crate) fn ndp_cleanup_state(&mut self, nic: &Nic, host_only: bool) {
        let prefixes: Vec<Subnet> = self.ndp.slaac_prefixes.keys().copied().collect();
        let link_local = ipv6_link_local_subnet();
        for prefix in prefixes {
            if host_only && prefix == link_local {
                continue;
            }
            self.ndp_invalidate_slaac_prefix(nic, prefix);
        }

        let routers: Vec<Ipv6Addr> = self.ndp.default_routers.keys().copied().collect();
        for router in routers {
            self.invalidate_default_router(nic, router);
        }

        let on_link: Vec<Subnet> = self.ndp.on_link_prefixes.keys().copied().collect();
        for prefix in on_link {
            self.invalidate_on_link_prefix(nic, prefix);
        }
    }

    /// Clean up after a stable SLAAC address was removed from outside the
    /// prefix machinery (administratively or by a DAD conflict).
    pub(crate) fn ndp_cleanup_slaac_addr(
        &mut self,
        nic: &Nic,
        addr: AddressWithPrefix,
        allow_invalidation: bool,
    ) {
        let prefix = addr.subnet();
        let Some(state) = self.ndp.slaac_prefixes.get_mut(&prefix) else {
            return;
        };
        if state.stable_addr.map(IpAddr::V6) == Some(addr.address) {
            state.stable_addr = None;
        }

        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_auto_gen_address_invalidated(nic.id(), addr);
        }

        if allow_invalidation && state.stable_addr.is_none() && state.temp_addrs.is_empty() {
            let state = self.ndp.slaac_prefixes.remove(&prefix).unwrap();
            state.cancel_timers();
        }
    }

    /// Clean up after a temporary SLAAC address was removed from outside
    /// the prefix machinery.
    pub(crate) fn ndp_cleanup_temp_slaac_addr(
        &mut self,
        nic: &Nic,
        addr: AddressWithPrefix,
        allow_invalidation: bool,
    ) {
        let prefix = addr.subnet();
        let Some(state) = self.ndp.slaac_prefixes.get_mut(&prefix) else {
            return;
        };
        let IpAddr::V6(v6) = addr.address else {
            return;
        };
        if let Some(temp) = state.temp_addrs.remove(&v6) {
            temp.cancel_timers();
        }

        if let Some(disp) = nic.stack().ndp_dispatcher() {
            disp.on_auto_gen_address_invalidated(nic.id(), addr);
        }

        if allow_invalidation && state.stable_addr.is_none() && state.temp_addrs.is_empty() {
            let state = self.ndp.slaac_prefixes.remove(&prefix).unwrap();
            state.cancel_timers();
        }
    }

    pub(crate) fn ndp_handle_timer(&mut self, nic: &Nic, ev: NdpTimerEvent) {
        match ev {
            NdpTimerEvent::DadTick(addr) => self.dad_tick(nic, addr),
            NdpTimerEvent::RouterSolicitTick => self.router_solicit_tick(nic),
            NdpTimerEvent::RouterInvalidated(addr) => self.invalidate_default_router(nic, addr),
            NdpTimerEvent::OnLinkPrefixInvalidated(subnet) => {
                self.invalidate_on_link_prefix(nic, subnet)
            }
            NdpTimerEvent::SlaacPrefixDeprecated(subnet) => {
                let addr = self
                    .ndp
                    .slaac_prefixes
                    .get(&subnet)
                    .and_then(|s| s.stable_addr);
                if let Some(addr) = addr {
                    self.set_slaac_addr_deprecated(nic, IpAddr::V6(addr), true);
                }
            }
            NdpTimerEvent::SlaacPrefixInvalidated(subnet) => {
                self.ndp_invalidate_slaac_prefix(nic, subnet)
            }
            NdpTimerEvent::TempAddrDeprecated(subnet, addr) => {
                let known = self
                    .ndp
                    .slaac_prefixes
                    .get(&subnet)
                    .is_some_and(|s| s.temp_addrs.contains_key(&addr));
                if known {
                    self.set_slaac_addr_deprecated(nic, IpAddr::V6(addr), true);
                }
            }
            NdpTimerEvent::TempAddrInvalidated(subnet, addr) => {
                let removed = self
                    .ndp
                    .slaac_prefixes
                    .get_mut(&subnet)
                    .and_then(|s| s.temp_addrs.remove(&addr));
                if let Some(temp) = removed {
                    temp.cancel_timers();
                    self.remove_slaac_generated_addr(nic, IpAddr::V6(addr));
                }
            }
            NdpTimerEvent::TempAddrRegen(subnet) => {
                self.generate_temp_slaac_addr(nic, subnet);
            }
        }
    }
}

fn notify_dad_status(nic: &Nic, addr: Ipv6Addr, resolved: bool) {
    if let Some(disp) = nic.stack().ndp_dispatcher() {
        disp.on_duplicate_address_detection_status(nic.id(), addr, resolved);
    }
}

fn cap_lifetime(remaining: Option<Duration>, max: Duration) -> Duration {
    match remaining {
        Some(d) => d.min(max),
        None => max,
    }
}

/// Modified EUI-64 interface identifier within a /64 prefix (RFC 4291
/// appendix A)
pub(crate) fn eui64_addr(prefix: Subnet, mac: LinkAddr) -> Ipv6Addr {
    let m = &mac.0;
    let iid = [m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]];
    addr_from_prefix_and_iid(prefix, iid)
}

/// Opaque interface identifier (RFC 7217): a hash over the prefix, the
/// interface name, a generation counter and a local secret.
fn opaque_iid_addr(prefix: Subnet, secret: &[u8; 32], nic_name: &str, counter: u64) -> Ipv6Addr {
    hashed_iid_addr(prefix, secret, nic_name.as_bytes(), counter, b"stable")
}

/// Temporary (privacy) interface identifier (RFC 4941 section 3.2, realized
/// with the same hash construction as opaque identifiers)
fn temp_iid_addr(prefix: Subnet, secret: &[u8; 32], counter: u64) -> Ipv6Addr {
    hashed_iid_addr(prefix, secret, b"", counter, b"temp")
}

fn hashed_iid_addr(
    prefix: Subnet,
    secret: &[u8; 32],
    extra: &[u8],
    counter: u64,
    purpose: &[u8],
) -> Ipv6Addr {
    let IpAddr::V6(network) = prefix.network() else {
        unreachable!("SLAAC prefixes are IPv6");
    };
    let mut hasher = Sha256::new();
    hasher.update(&network.octets()[..8]);
    hasher.update(extra);
    hasher.update(counter.to_be_bytes());
    hasher.update(purpose);
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut iid = [0u8; 8];
    iid.copy_from_slice(&digest[..8]);
    addr_from_prefix_and_iid(prefix, iid)
}

fn addr_from_prefix_and_iid(prefix: Subnet, iid: [u8; 8]) -> Ipv6Addr {
    let IpAddr::V6(network) = prefix.network() else {
        unreachable!("SLAAC prefixes are IPv6");
    };
    let mut octets = network.octets();
    octets[8..].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}

impl Nic {
    /// Emit a DAD probe: an NS for the tentative address, sent from the
    /// unspecified address to the solicited-node multicast group, with no
    /// source link-layer option (RFC 4862 section 5.4.2).
    pub(crate) fn send_dad_probe(&self, addr: Ipv6Addr) {
        let dst = solicited_node_multicast(addr);
        let mut payload = icmpv6::NeighborSolicitation::new(addr, None).to_bytes();
        icmpv6::set_checksum(&mut payload, &Ipv6Addr::UNSPECIFIED, &dst);
        trace!(nic = self.name(), %addr, "sending DAD probe");
        self.send_ndp_packet(Ipv6Addr::UNSPECIFIED, dst, payload);
    }

    /// Emit a Router Solicitation to the all-routers group, sourced from an
    /// assigned link-local address when one exists.
    pub(crate) fn send_router_solicitation(&self) {
        let src = self.assigned_link_local_addr().unwrap_or(Ipv6Addr::UNSPECIFIED);
        let dst = all_routers_multicast();

        // An unspecified source must not carry a source link-layer option
        // (RFC 4861 section 4.1).
        let slla = if src.is_unspecified() {
            None
        } else {
            Some(self.link_endpoint().link_address())
        };
        let mut payload = icmpv6::RouterSolicitation::new(slla).to_bytes();
        icmpv6::set_checksum(&mut payload, &src, &dst);
        trace!(nic = self.name(), "sending router solicitation");
        self.send_ndp_packet(src, dst, payload);
    }

    fn assigned_link_local_addr(&self) -> Option<Ipv6Addr> {
        let ep = self.network_endpoint(IPV6_PROTOCOL)?;
        let link_local = ipv6_link_local_subnet();
        let mut found = None;
        for entry in ep.all_endpoints() {
            if found.is_none()
                && link_local.contains(entry.address())
                && entry.is_assigned(false)
            {
                if let IpAddr::V6(v6) = entry.address() {
                    found = Some(v6);
                }
            }
            entry.dec_ref();
        }
        found
    }

    fn send_ndp_packet(&self, src: Ipv6Addr, dst: Ipv6Addr, payload: Vec<u8>) {
        let link = self.link_endpoint();
        let pkt = PacketBuffer::with_headroom(link.max_header_length(), &payload);
        let route = Route::new(
            IpAddr::V6(src),
            IpAddr::V6(dst),
            Some(link.link_address()),
            Some(LinkAddr::ipv6_multicast(dst)),
            None,
            None,
        );
        if link.write_packet(&route, IPV6_PROTOCOL, pkt).is_err() {
            self.stack().stats.ip.outgoing_packet_errors.inc();
        }
    }
}
