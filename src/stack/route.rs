//! Route
//!
//! A resolved path for one packet: addresses at both layers, the optional
//! next hop, and the referenced endpoint anchoring the local address. The
//! route owns its endpoint reference; dropping the route releases it, so
//! handing a route to the forwarding queue transfers that obligation.

use crate::protocol::LinkAddr;
use crate::stack::nic::Nic;
use crate::stack::referenced::ReferencedEndpoint;
use crate::{Error, Result};
use std::net::IpAddr;
use std::sync::{mpsc, Arc};

/// Outcome of link-address resolution for a route
pub enum Resolution {
    /// The remote link address is filled in; the route is ready to use
    Resolved,
    /// Resolution is in flight; the channel yields the result
    Pending(mpsc::Receiver<Option<LinkAddr>>),
}

pub struct Route {
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub local_link_address: Option<LinkAddr>,
    pub remote_link_address: Option<LinkAddr>,
    /// Gateway to send through, when the destination is not on-link
    pub next_hop: Option<IpAddr>,
    ref_: Option<ReferencedEndpoint>,
}

impl Route {
    pub fn new(
        local_address: IpAddr,
        remote_address: IpAddr,
        local_link_address: Option<LinkAddr>,
        remote_link_address: Option<LinkAddr>,
        next_hop: Option<IpAddr>,
        ref_: Option<ReferencedEndpoint>,
    ) -> Self {
        Self {
            local_address,
            remote_address,
            local_link_address,
            remote_link_address,
            next_hop,
            ref_,
        }
    }

    /// Route for delivering a received packet up the stack: local is the
    /// packet's destination, remote its source.
    pub(crate) fn for_local_delivery(
        local_address: IpAddr,
        remote_address: IpAddr,
        local_link_address: Option<LinkAddr>,
        remote_link_address: Option<LinkAddr>,
        ref_: ReferencedEndpoint,
    ) -> Self {
        Self {
            local_address,
            remote_address,
            local_link_address,
            remote_link_address,
            next_hop: None,
            ref_: Some(ref_),
        }
    }

    pub fn referenced_endpoint(&self) -> Option<&ReferencedEndpoint> {
        self.ref_.as_ref()
    }

    /// The interface this route sends through.
    pub fn nic(&self) -> Option<Arc<Nic>> {
        self.ref_.as_ref().and_then(|r| r.nic())
    }

    /// The address link-address resolution operates on.
    fn next_hop_or_remote(&self) -> IpAddr {
        self.next_hop.unwrap_or(self.remote_address)
    }

    /// Resolve the remote link address.
    ///
    /// Multicast and broadcast destinations resolve immediately from their
    /// fixed mappings. Otherwise the link-address cache is consulted and,
    /// on a miss, a resolution request goes out and `Pending` carries the
    /// completion channel.
    pub fn resolve(&mut self) -> Result<Resolution> {
        if self.remote_link_address.is_some() {
            return Ok(Resolution::Resolved);
        }

        let target = self.next_hop_or_remote();

        if let Some(link_addr) = LinkAddr::for_remote_multicast(target) {
            self.remote_link_address = Some(link_addr);
            return Ok(Resolution::Resolved);
        }

        let Some(ref_) = self.ref_.as_ref() else {
            return Err(Error::NotSupported);
        };
        let (Some(resolver), Some(cache)) = (ref_.link_resolver(), ref_.link_cache()) else {
            return Err(Error::NotSupported);
        };

        if let Some(link_addr) = resolver.resolve_static_address(target) {
            self.remote_link_address = Some(link_addr);
            return Ok(Resolution::Resolved);
        }

        if let Some(link_addr) = cache.get(target) {
            self.remote_link_address = Some(link_addr);
            return Ok(Resolution::Resolved);
        }

        let Some(nic) = ref_.nic() else {
            return Err(Error::NotSupported);
        };
        let rx = cache.start_resolution(
            target,
            Some(self.local_address),
            resolver.as_ref(),
            nic.link_endpoint().as_ref(),
        );
        Ok(Resolution::Pending(rx))
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("local_link_address", &self.local_link_address)
            .field("remote_link_address", &self.remote_link_address)
            .field("next_hop", &self.next_hop)
            .finish()
    }
}

