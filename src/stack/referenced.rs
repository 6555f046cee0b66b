//! Referenced network endpoint
//!
//! A handle binding an address endpoint to its owning interface, protocol
//! and (when the link resolves addresses) the resolver serving it. The
//! handle owns one logical reference on the address entry, released on
//! drop, so a lookup result stays usable while the address table is
//! mutated underneath it.

use crate::protocol::{AddressWithPrefix, NetworkProtocolId};
use crate::stack::address_table::{AddressConfigType, AddressEntry, AddressKind};
use crate::stack::endpoints::{LinkAddressResolver, NetworkEndpoint};
use crate::stack::neighbor_cache::LinkAddrCache;
use crate::stack::nic::Nic;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

pub struct ReferencedEndpoint {
    nic: Weak<Nic>,
    protocol: NetworkProtocolId,
    ep: Arc<dyn NetworkEndpoint>,
    entry: Arc<AddressEntry>,
    link_res: Option<Arc<dyn LinkAddressResolver>>,
    link_cache: Option<Arc<LinkAddrCache>>,
}

impl ReferencedEndpoint {
    /// Wrap an address entry. The entry must already carry a logical
    /// reference for this handle; the handle assumes ownership of it.
    pub(crate) fn new(
        nic: Weak<Nic>,
        protocol: NetworkProtocolId,
        ep: Arc<dyn NetworkEndpoint>,
        entry: Arc<AddressEntry>,
        link_res: Option<Arc<dyn LinkAddressResolver>>,
        link_cache: Option<Arc<LinkAddrCache>>,
    ) -> Self {
        Self {
            nic,
            protocol,
            ep,
            entry,
            link_res,
            link_cache,
        }
    }

    pub fn protocol(&self) -> NetworkProtocolId {
        self.protocol
    }

    pub fn network_endpoint(&self) -> &Arc<dyn NetworkEndpoint> {
        &self.ep
    }

    pub fn entry(&self) -> &Arc<AddressEntry> {
        &self.entry
    }

    pub fn nic(&self) -> Option<Arc<Nic>> {
        self.nic.upgrade()
    }

    pub fn link_resolver(&self) -> Option<&Arc<dyn LinkAddressResolver>> {
        self.link_res.as_ref()
    }

    pub fn link_cache(&self) -> Option<&Arc<LinkAddrCache>> {
        self.link_cache.as_ref()
    }

    pub fn address(&self) -> IpAddr {
        self.entry.address()
    }

    pub fn addr_with_prefix(&self) -> AddressWithPrefix {
        self.entry.address_with_prefix()
    }

    pub fn kind(&self) -> AddressKind {
        self.entry.kind()
    }

    pub fn set_kind(&self, kind: AddressKind) {
        self.entry.set_kind(kind)
    }

    pub fn config_type(&self) -> AddressConfigType {
        self.entry.config_type()
    }

    pub fn deprecated(&self) -> bool {
        self.entry.deprecated()
    }

    pub fn set_deprecated(&self, deprecated: bool) {
        self.entry.set_deprecated(deprecated)
    }

    pub fn is_assigned(&self, allow_unassigned: bool) -> bool {
        self.entry.is_assigned(allow_unassigned)
    }

    /// True if the endpoint may source outgoing packets: the interface is
    /// enabled and the address is assigned (or the interface spoofs).
    pub fn is_valid_for_outgoing(&self) -> bool {
        let Some(nic) = self.nic.upgrade() else {
            return false;
        };
        let (enabled, spoofing, _) = nic.mode_flags();
        enabled && self.entry.is_assigned(spoofing)
    }

    /// Take an additional reference, returning a second handle.
    pub fn clone_ref(&self) -> Self {
        self.entry.inc_ref();
        Self {
            nic: self.nic.clone(),
            protocol: self.protocol,
            ep: self.ep.clone(),
            entry: self.entry.clone(),
            link_res: self.link_res.clone(),
            link_cache: self.link_cache.clone(),
        }
    }

    /// Remove the address from its table. The entry is marked expired and
    /// survives until the last handle drops.
    pub fn expire(self) {
        let _ = self.ep.remove_address(self.address());
    }
}

impl Drop for ReferencedEndpoint {
    fn drop(&mut self) {
        self.entry.dec_ref();
    }
}

impl std::fmt::Debug for ReferencedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferencedEndpoint")
            .field("protocol", &self.protocol)
            .field("address", &self.addr_with_prefix())
            .field("kind", &self.kind())
            .finish()
    }
}
