//! Neighbor cache (RFC 4861 section 7.3)
//!
//! IP-to-link-address mappings learned through NDP or ARP, plus static
//! entries. Waiters register wakers that fire when an entry completes
//! resolution. The separate `LinkAddrCache` backs route resolution with a
//! channel-based completion signal for the forwarding queue.

use crate::config::NudConfigurations;
use crate::protocol::LinkAddr;
use crate::stack::context::Clock;
use crate::stack::endpoints::{LinkAddressResolver, LinkEndpoint};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::Instant;
use tracing::debug;

/// Upper bound on dynamic neighbor entries
pub const NEIGHBOR_CACHE_SIZE: usize = 512;

/// Reachability state of a neighbor entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborEntryState {
    /// Address resolution in progress
    Incomplete,
    /// Recently confirmed reachable
    Reachable,
    /// Reachability unknown; will be probed on next use
    Stale,
    /// Administratively configured, never aged out
    Static,
}

/// Snapshot of one neighbor entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub addr: IpAddr,
    pub link_addr: Option<LinkAddr>,
    pub state: NeighborEntryState,
    pub updated_at: Instant,
}

struct CacheEntry {
    link_addr: Option<LinkAddr>,
    state: NeighborEntryState,
    updated_at: Instant,
    wakers: Vec<Waker>,
}

/// Per-interface neighbor cache.
pub struct NeighborCache {
    clock: Arc<dyn Clock>,
    config: Mutex<NudConfigurations>,
    entries: Mutex<HashMap<IpAddr, CacheEntry>>,
}

impl NeighborCache {
    pub fn new(clock: Arc<dyn Clock>, config: NudConfigurations) -> Arc<Self> {
        Arc::new(Self {
            clock,
            config: Mutex::new(config),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> NudConfigurations {
        self.config.lock().unwrap().clone()
    }

    pub fn set_config(&self, config: NudConfigurations) {
        *self.config.lock().unwrap() = config;
    }

    /// Snapshot all entries.
    pub fn entries(&self) -> Vec<NeighborEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(addr, e)| NeighborEntry {
                addr: *addr,
                link_addr: e.link_addr,
                state: e.state,
                updated_at: e.updated_at,
            })
            .collect()
    }

    /// Add or replace a static entry.
    pub fn add_static_entry(&self, addr: IpAddr, link_addr: LinkAddr) {
        let mut entries = self.entries.lock().unwrap();
        let wakers = match entries.remove(&addr) {
            Some(old) => old.wakers,
            None => Vec::new(),
        };
        entries.insert(
            addr,
            CacheEntry {
                link_addr: Some(link_addr),
                state: NeighborEntryState::Static,
                updated_at: self.clock.now(),
                wakers: Vec::new(),
            },
        );
        drop(entries);
        for waker in wakers {
            waker.wake();
        }
    }

    /// Remove an entry. Returns false if no entry existed.
    pub fn remove_entry(&self, addr: IpAddr) -> bool {
        self.entries.lock().unwrap().remove(&addr).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Look up an entry, starting resolution when none is usable.
    ///
    /// Returns `WouldBlock` while resolution is in flight; the optional
    /// waker fires once the entry completes.
    pub fn entry(
        &self,
        addr: IpAddr,
        local_addr: Option<IpAddr>,
        resolver: &dyn LinkAddressResolver,
        link: &dyn LinkEndpoint,
        waker: Option<Waker>,
    ) -> Result<NeighborEntry> {
        if let Some(link_addr) = resolver.resolve_static_address(addr) {
            return Ok(NeighborEntry {
                addr,
                link_addr: Some(link_addr),
                state: NeighborEntryState::Static,
                updated_at: self.clock.now(),
            });
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&addr) {
            match entry.state {
                NeighborEntryState::Incomplete => {
                    if let Some(waker) = waker {
                        entry.wakers.push(waker);
                    }
                    return Err(Error::WouldBlock);
                }
                _ => {
                    return Ok(NeighborEntry {
                        addr,
                        link_addr: entry.link_addr,
                        state: entry.state,
                        updated_at: entry.updated_at,
                    });
                }
            }
        }

        if entries.len() >= NEIGHBOR_CACHE_SIZE {
            // Evict the stalest dynamic entry to stay within bounds.
            if let Some(victim) = entries
                .iter()
                .filter(|(_, e)| e.state != NeighborEntryState::Static)
                .min_by_key(|(_, e)| e.updated_at)
                .map(|(a, _)| *a)
            {
                entries.remove(&victim);
            }
        }

        entries.insert(
            addr,
            CacheEntry {
                link_addr: None,
                state: NeighborEntryState::Incomplete,
                updated_at: self.clock.now(),
                wakers: waker.into_iter().collect(),
            },
        );
        drop(entries);

        debug!(%addr, "starting neighbor resolution");
        let _ = resolver.link_address_request(addr, local_addr, link);
        Err(Error::WouldBlock)
    }

    /// Record a resolution result (from a received NA or ARP reply) and
    /// wake any waiters.
    pub fn handle_confirmation(&self, addr: IpAddr, link_addr: LinkAddr) {
        let wakers = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(addr).or_insert_with(|| CacheEntry {
                link_addr: None,
                state: NeighborEntryState::Incomplete,
                updated_at: self.clock.now(),
                wakers: Vec::new(),
            });
            if entry.state == NeighborEntryState::Static {
                return;
            }
            entry.link_addr = Some(link_addr);
            entry.state = NeighborEntryState::Reachable;
            entry.updated_at = self.clock.now();
            std::mem::take(&mut entry.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Age reachable entries to stale once their reachable window lapses.
    pub fn refresh_states(&self) {
        let base_reachable = self.config.lock().unwrap().base_reachable_time;
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.state == NeighborEntryState::Reachable
                && now.duration_since(entry.updated_at) > base_reachable
            {
                entry.state = NeighborEntryState::Stale;
            }
        }
    }

    /// Deregister a waker previously passed to `entry`.
    pub fn remove_waker(&self, addr: IpAddr, waker: &Waker) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&addr) {
            entry.wakers.retain(|w| !w.will_wake(waker));
        }
    }
}

enum LinkCacheSlot {
    Ready(LinkAddr),
    Pending(Vec<mpsc::Sender<Option<LinkAddr>>>),
}

/// Stack-wide cache of resolved link addresses used by route resolution.
///
/// Pending resolutions hand out a channel; the receiver observes
/// `Some(addr)` on success or `None` when resolution fails.
#[derive(Default)]
pub struct LinkAddrCache {
    slots: Mutex<HashMap<IpAddr, LinkCacheSlot>>,
}

impl LinkAddrCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A resolved link address, if known.
    pub fn get(&self, addr: IpAddr) -> Option<LinkAddr> {
        match self.slots.lock().unwrap().get(&addr) {
            Some(LinkCacheSlot::Ready(link_addr)) => Some(*link_addr),
            _ => None,
        }
    }

    /// Begin (or join) resolution of `addr`, returning the completion
    /// channel. A resolution request is sent only for the first waiter.
    pub fn start_resolution(
        &self,
        addr: IpAddr,
        local_addr: Option<IpAddr>,
        resolver: &dyn LinkAddressResolver,
        link: &dyn LinkEndpoint,
    ) -> mpsc::Receiver<Option<LinkAddr>> {
        let (tx, rx) = mpsc::channel();

        let request = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(&addr) {
                Some(LinkCacheSlot::Ready(link_addr)) => {
                    let _ = tx.send(Some(*link_addr));
                    false
                }
                Some(LinkCacheSlot::Pending(waiters)) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    slots.insert(addr, LinkCacheSlot::Pending(vec![tx]));
                    true
                }
            }
        };

        if request {
            let _ = resolver.link_address_request(addr, local_addr, link);
        }
        rx
    }

    /// Record a resolved mapping and complete pending waiters.
    pub fn add(&self, addr: IpAddr, link_addr: LinkAddr) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(LinkCacheSlot::Pending(waiters)) =
            slots.insert(addr, LinkCacheSlot::Ready(link_addr))
        {
            for waiter in waiters {
                let _ = waiter.send(Some(link_addr));
            }
        }
    }

    /// Fail a pending resolution, notifying waiters.
    pub fn fail(&self, addr: IpAddr) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(LinkCacheSlot::Pending(waiters)) = slots.remove(&addr) {
            for waiter in waiters {
                let _ = waiter.send(None);
            }
        }
    }
}
