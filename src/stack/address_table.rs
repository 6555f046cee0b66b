//! Per-protocol address table
//!
//! Holds the addresses assigned to an interface for one network protocol,
//! with primacy ordering for source-address selection and reference-counted
//! entries so lookups stay usable while the table is mutated concurrently.

use crate::protocol::AddressWithPrefix;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Lifecycle kind of an assigned address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Administratively assigned and fully usable
    Permanent,
    /// Assigned but DAD is still in progress; not usable as a source and
    /// must not answer for the address
    PermanentTentative,
    /// Logically removed but still referenced by an outstanding handle
    PermanentExpired,
    /// Synthesized on the fly for a spoofing or promiscuous lookup
    Temporary,
}

impl AddressKind {
    pub fn is_permanent(self) -> bool {
        matches!(self, AddressKind::Permanent | AddressKind::PermanentTentative)
    }
}

/// How an address came to be assigned, which determines teardown duties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressConfigType {
    /// Added explicitly
    Static,
    /// Generated by stateless autoconfiguration
    Slaac,
    /// Temporary (privacy) address generated alongside a SLAAC address
    SlaacTemp,
}

/// Whether an endpoint participates in source-address selection for
/// connections with no bound local address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryEndpointBehavior {
    /// Considered before all CanBePrimary endpoints
    FirstPrimary,
    /// The default
    CanBePrimary,
    /// Usable for directed lookups only
    NeverPrimary,
}

/// Properties for a new or promoted address
#[derive(Debug, Clone, Copy)]
pub struct AddAddressOptions {
    pub kind: AddressKind,
    pub config_type: AddressConfigType,
    pub peb: PrimaryEndpointBehavior,
    pub deprecated: bool,
}

impl Default for AddAddressOptions {
    fn default() -> Self {
        Self {
            kind: AddressKind::Permanent,
            config_type: AddressConfigType::Static,
            peb: PrimaryEndpointBehavior::CanBePrimary,
            deprecated: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryState {
    kind: AddressKind,
    config_type: AddressConfigType,
    peb: PrimaryEndpointBehavior,
    deprecated: bool,
}

/// One assigned address.
///
/// The table owns one logical reference for every entry it holds, except
/// temporary entries, which live only as long as their outstanding handles.
/// Every `Arc<AddressEntry>` returned across the table boundary carries a
/// logical reference the receiver must release with `dec_ref`.
#[derive(Debug)]
pub struct AddressEntry {
    addr: AddressWithPrefix,
    state: Mutex<EntryState>,
    refs: AtomicUsize,
    table: Weak<AddressTable>,
}

impl AddressEntry {
    pub fn address_with_prefix(&self) -> AddressWithPrefix {
        self.addr
    }

    pub fn address(&self) -> IpAddr {
        self.addr.address
    }

    pub fn kind(&self) -> AddressKind {
        self.state.lock().unwrap().kind
    }

    pub fn set_kind(&self, kind: AddressKind) {
        self.state.lock().unwrap().kind = kind;
    }

    pub fn config_type(&self) -> AddressConfigType {
        self.state.lock().unwrap().config_type
    }

    pub fn peb(&self) -> PrimaryEndpointBehavior {
        self.state.lock().unwrap().peb
    }

    pub fn deprecated(&self) -> bool {
        self.state.lock().unwrap().deprecated
    }

    pub fn set_deprecated(&self, deprecated: bool) {
        self.state.lock().unwrap().deprecated = deprecated;
    }

    /// Whether the address answers for traffic. Tentative and expired
    /// addresses only count when the caller is allowed unassigned ones
    /// (spoofing on egress, promiscuous on ingress).
    pub fn is_assigned(&self, allow_unassigned: bool) -> bool {
        match self.kind() {
            AddressKind::Permanent | AddressKind::Temporary => true,
            AddressKind::PermanentTentative | AddressKind::PermanentExpired => allow_unassigned,
        }
    }

    /// Current logical reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Increment the reference count. Only valid while a reference is
    /// already held; use `try_inc_ref` otherwise.
    pub fn inc_ref(&self) {
        let _ = self.try_inc_ref();
    }

    /// Increment the reference count unless it has already reached zero.
    /// An entry at zero is dead and must not be resurrected.
    pub fn try_inc_ref(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => refs = actual,
            }
        }
    }

    /// Release one reference. At zero the entry is detached from its table.
    pub fn dec_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "address entry reference underflow");
        if prev == 1 {
            if let Some(table) = self.table.upgrade() {
                table.release(self.addr.address, self as *const _);
            }
        }
    }

    fn promote(&self, opts: AddAddressOptions) {
        let mut state = self.state.lock().unwrap();
        state.kind = opts.kind;
        state.config_type = opts.config_type;
        state.peb = opts.peb;
        state.deprecated = opts.deprecated;
    }
}

#[derive(Debug, Default)]
struct TableInner {
    endpoints: std::collections::HashMap<IpAddr, Arc<AddressEntry>>,
    /// Primacy ordering: the FirstPrimary block (most recent first), then
    /// the CanBePrimary block (most recent first). NeverPrimary endpoints
    /// are not listed.
    primary: Vec<Arc<AddressEntry>>,
}

impl TableInner {
    fn insert_primary(&mut self, entry: Arc<AddressEntry>) {
        let at = match entry.peb() {
            PrimaryEndpointBehavior::NeverPrimary => return,
            PrimaryEndpointBehavior::FirstPrimary => 0,
            PrimaryEndpointBehavior::CanBePrimary => self
                .primary
                .iter()
                .position(|e| e.peb() != PrimaryEndpointBehavior::FirstPrimary)
                .unwrap_or(self.primary.len()),
        };
        self.primary.insert(at, entry);
    }

    fn remove_primary(&mut self, entry: &Arc<AddressEntry>) {
        self.primary.retain(|e| !Arc::ptr_eq(e, entry));
    }
}

/// The set of addresses assigned to one (interface, protocol) pair.
#[derive(Debug)]
pub struct AddressTable {
    inner: Mutex<TableInner>,
    weak_self: Weak<AddressTable>,
}

impl AddressTable {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(TableInner::default()),
            weak_self: weak.clone(),
        })
    }

    /// Add an address.
    ///
    /// An existing non-permanent entry is promoted in place when the new
    /// kind is permanent, overwriting its properties. Any other collision
    /// fails with `DuplicateAddress`.
    pub fn add(
        &self,
        addr: AddressWithPrefix,
        opts: AddAddressOptions,
    ) -> Result<Arc<AddressEntry>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.endpoints.get(&addr.address).cloned() {
            if existing.kind().is_permanent() || !opts.kind.is_permanent() {
                return Err(Error::DuplicateAddress(addr.address));
            }
            existing.promote(opts);
            inner.remove_primary(&existing);
            inner.insert_primary(existing.clone());
            // A temporary entry carried no table reference; promotion makes
            // it table-owned, and the returned handle needs its own.
            existing.inc_ref();
            existing.inc_ref();
            return Ok(existing);
        }

        let entry = Arc::new(AddressEntry {
            addr,
            state: Mutex::new(EntryState {
                kind: opts.kind,
                config_type: opts.config_type,
                peb: opts.peb,
                deprecated: opts.deprecated,
            }),
            // One reference for the table, one for the returned handle.
            refs: AtomicUsize::new(2),
            table: self.weak_self.clone(),
        });
        inner.endpoints.insert(addr.address, entry.clone());
        inner.insert_primary(entry.clone());
        Ok(entry)
    }

    /// Look up an entry by exact address, regardless of kind.
    pub fn get(&self, addr: IpAddr) -> Option<Arc<AddressEntry>> {
        let inner = self.inner.lock().unwrap();
        inner.endpoints.get(&addr).map(|e| {
            e.inc_ref();
            e.clone()
        })
    }

    /// Look up an assigned endpoint for `addr`.
    ///
    /// Falls back to the owning prefix's endpoint for an IPv4 directed
    /// broadcast, to any covering prefix on loopback, and finally to a
    /// freshly created temporary endpoint when `allow_temp` is set.
    pub fn get_assigned(
        &self,
        addr: IpAddr,
        is_loopback: bool,
        allow_temp: bool,
        peb: PrimaryEndpointBehavior,
    ) -> Option<Arc<AddressEntry>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.endpoints.get(&addr) {
            if entry.is_assigned(allow_temp) {
                entry.inc_ref();
                return Some(entry.clone());
            }
            return None;
        }

        if let IpAddr::V4(_) = addr {
            for entry in inner.endpoints.values() {
                let subnet = entry.address_with_prefix().subnet();
                if subnet.broadcast().map(IpAddr::V4) == Some(addr) && entry.is_assigned(allow_temp)
                {
                    entry.inc_ref();
                    return Some(entry.clone());
                }
            }
        }

        if is_loopback {
            for entry in inner.endpoints.values() {
                if entry.address_with_prefix().subnet().contains(addr)
                    && entry.is_assigned(allow_temp)
                {
                    entry.inc_ref();
                    return Some(entry.clone());
                }
            }
        }

        if !allow_temp {
            return None;
        }

        let entry = Arc::new(AddressEntry {
            addr: AddressWithPrefix::new(addr, host_prefix_len(addr)),
            state: Mutex::new(EntryState {
                kind: AddressKind::Temporary,
                config_type: AddressConfigType::Static,
                peb,
                deprecated: false,
            }),
            // Temporary entries are owned by their handles alone; the table
            // drops them as soon as the last reference goes away.
            refs: AtomicUsize::new(1),
            table: self.weak_self.clone(),
        });
        inner.endpoints.insert(addr, entry.clone());
        inner.insert_primary(entry.clone());
        Some(entry)
    }

    /// Select a source endpoint for traffic towards `remote`.
    ///
    /// IPv6 selection follows RFC 6724 section 5; otherwise the first
    /// non-deprecated primary endpoint wins, falling back to the first
    /// deprecated one.
    pub fn primary_endpoint(
        &self,
        remote: Option<IpAddr>,
        spoofing: bool,
    ) -> Option<Arc<AddressEntry>> {
        let candidates: Vec<Arc<AddressEntry>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .primary
                .iter()
                .filter(|e| e.is_assigned(spoofing))
                .cloned()
                .collect()
        };

        let chosen = match remote {
            Some(IpAddr::V6(remote)) => select_source_v6(&candidates, remote),
            _ => candidates
                .iter()
                .find(|e| !e.deprecated())
                .or_else(|| candidates.first())
                .cloned(),
        };

        chosen.inspect(|e| e.inc_ref())
    }

    /// True if `addr` is a permanent (possibly tentative) address here.
    pub fn has(&self, addr: IpAddr) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .get(&addr)
            .is_some_and(|e| e.kind().is_permanent())
    }

    pub fn all_endpoints(&self) -> Vec<Arc<AddressEntry>> {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .values()
            .map(|e| {
                e.inc_ref();
                e.clone()
            })
            .collect()
    }

    pub fn all_addresses(&self) -> Vec<AddressWithPrefix> {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .values()
            .map(|e| e.address_with_prefix())
            .collect()
    }

    pub fn primary_addresses(&self) -> Vec<AddressWithPrefix> {
        let inner = self.inner.lock().unwrap();
        inner
            .primary
            .iter()
            .map(|e| e.address_with_prefix())
            .collect()
    }

    /// Expire an address: detach it from the table, mark it expired, and
    /// drop the table's owning reference. Outstanding handles keep the
    /// entry alive until each is released.
    pub fn remove(&self, addr: IpAddr) -> Result<()> {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .endpoints
                .remove(&addr)
                .ok_or(Error::BadLocalAddress(addr))?;
            inner.remove_primary(&entry);
            entry
        };
        entry.set_kind(AddressKind::PermanentExpired);
        entry.dec_ref();
        Ok(())
    }

    /// Expire every address.
    pub fn remove_all(&self) {
        let entries: Vec<Arc<AddressEntry>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.primary.clear();
            inner.endpoints.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            let was_temporary = entry.kind() == AddressKind::Temporary;
            entry.set_kind(AddressKind::PermanentExpired);
            // Temporary entries carry no table reference.
            if !was_temporary {
                entry.dec_ref();
            }
        }
    }

    /// Called by an entry whose reference count reached zero while still
    /// listed (temporary endpoints).
    fn release(&self, addr: IpAddr, ptr: *const AddressEntry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.endpoints.get(&addr) {
            if std::ptr::eq(Arc::as_ptr(entry), ptr) {
                let entry = entry.clone();
                inner.endpoints.remove(&addr);
                inner.remove_primary(&entry);
            }
        }
    }
}

fn host_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Address scope per RFC 6724 section 3.1 (larger is wider)
fn ipv6_addr_scope(addr: Ipv6Addr) -> u8 {
    if addr.is_multicast() {
        return addr.octets()[1] & 0x0f;
    }
    let segments = addr.segments();
    if addr.is_loopback() || (segments[0] & 0xffc0) == 0xfe80 {
        return 0x02; // link-local
    }
    if (segments[0] & 0xfe00) == 0xfc00 {
        return 0x05; // unique-local, treated as site-local for selection
    }
    0x0e // global
}

fn common_prefix_len(a: Ipv6Addr, b: Ipv6Addr) -> u32 {
    (u128::from(a) ^ u128::from(b)).leading_zeros()
}

/// RFC 6724 source address selection over the primacy-ordered candidates.
/// Ties keep the earlier candidate, preserving primacy order.
fn select_source_v6(
    candidates: &[Arc<AddressEntry>],
    remote: Ipv6Addr,
) -> Option<Arc<AddressEntry>> {
    let v6: Vec<&Arc<AddressEntry>> = candidates
        .iter()
        .filter(|e| matches!(e.address(), IpAddr::V6(_)))
        .collect();

    let mut best: Option<&Arc<AddressEntry>> = None;
    for candidate in v6 {
        match best {
            None => best = Some(candidate),
            Some(current) => {
                if is_better_source_v6(candidate, current, remote) {
                    best = Some(candidate);
                }
            }
        }
    }
    best.cloned()
}

fn is_better_source_v6(a: &AddressEntry, b: &AddressEntry, remote: Ipv6Addr) -> bool {
    let (IpAddr::V6(av6), IpAddr::V6(bv6)) = (a.address(), b.address()) else {
        return false;
    };

    // Rule 1: prefer same address.
    if av6 == remote {
        return true;
    }
    if bv6 == remote {
        return false;
    }

    // Rule 2: prefer appropriate scope.
    let scope_a = ipv6_addr_scope(av6);
    let scope_b = ipv6_addr_scope(bv6);
    let scope_d = ipv6_addr_scope(remote);
    if scope_a < scope_b {
        return scope_a >= scope_d;
    }
    if scope_b < scope_a {
        return scope_b < scope_d;
    }

    // Rule 3: avoid deprecated addresses.
    match (a.deprecated(), b.deprecated()) {
        (false, true) => return true,
        (true, false) => return false,
        _ => {}
    }

    // Rule 8: use longest matching prefix.
    common_prefix_len(av6, remote) > common_prefix_len(bv6, remote)
}
