//! Route table
//!
//! In-memory CIDR routes keyed by network name. Routes are owned here and
//! mutated only by the control handlers (on receive) and the engine (on
//! peer disconnect or reload). Forwarding lookup is first-match in
//! insertion order; there is no longest-prefix preference in this
//! revision, and the strategy lives behind [`RouteTable::lookup`] so
//! changing it is a local edit.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use vibepn_crypto::PeerId;

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl IpNet {
    /// Parse `a.b.c.d/len` text. Returns `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        let (addr, len) = text.split_once('/')?;
        let address: Ipv4Addr = addr.parse().ok()?;
        let prefix_len: u8 = len.parse().ok()?;
        if prefix_len > 32 {
            return None;
        }
        Some(Self { address, prefix_len })
    }

    /// Whether `ip` falls within this network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = !0u32 << (32 - self.prefix_len as u32);
        (u32::from(self.address) & mask) == (u32::from(ip) & mask)
    }

    /// The network address (host bits zeroed).
    pub fn network_address(&self) -> Ipv4Addr {
        if self.prefix_len == 0 {
            return Ipv4Addr::UNSPECIFIED;
        }
        let mask = !0u32 << (32 - self.prefix_len as u32);
        Ipv4Addr::from(u32::from(self.address) & mask)
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

/// A learned or self-announced route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Overlay network name
    pub network: String,
    /// CIDR prefix as announced, e.g. `10.42.0.0/24`
    pub prefix: String,
    /// Peer the prefix is reachable through
    pub peer: PeerId,
    /// Route metric
    pub metric: u16,
    /// Optional expiry. Carried and reported, but no sweeper acts on it;
    /// liveness-driven removal is the effective garbage collector.
    pub expires_at: Option<DateTime<Utc>>,
}

/// The route table: network name → routes in insertion order.
pub struct RouteTable {
    routes: Mutex<HashMap<String, Vec<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a route, idempotent on `(network, prefix, peer)`; an
    /// existing entry has its metric and expiry updated in place.
    pub fn add(&self, route: Route) {
        let mut routes = self.routes.lock().unwrap();
        let list = routes.entry(route.network.clone()).or_default();

        for existing in list.iter_mut() {
            if existing.prefix == route.prefix && existing.peer == route.peer {
                *existing = route;
                return;
            }
        }
        list.push(route);
    }

    /// Remove every route attributed to `peer`, across all networks.
    pub fn remove_by_peer(&self, peer: &PeerId) {
        let mut routes = self.routes.lock().unwrap();
        for list in routes.values_mut() {
            list.retain(|r| &r.peer != peer);
        }
    }

    /// Remove a specific prefix in one network, regardless of peer.
    pub fn remove(&self, network: &str, prefix: &str) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(list) = routes.get_mut(network) {
            list.retain(|r| r.prefix != prefix);
        }
    }

    /// Snapshot of a network's routes, optionally excluding one peer.
    pub fn routes_for(&self, network: &str, exclude_peer: Option<&PeerId>) -> Vec<Route> {
        let routes = self.routes.lock().unwrap();
        routes
            .get(network)
            .map(|list| {
                list.iter()
                    .filter(|r| exclude_peer.map_or(true, |p| &r.peer != p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every route.
    pub fn all(&self) -> Vec<Route> {
        let routes = self.routes.lock().unwrap();
        routes.values().flatten().cloned().collect()
    }

    /// Forwarding lookup: the first route in insertion order whose prefix
    /// contains `destination`. Unparseable prefixes never match.
    pub fn lookup(&self, network: &str, destination: Ipv4Addr) -> Option<Route> {
        let routes = self.routes.lock().unwrap();
        routes.get(network)?.iter().find_map(|r| {
            let net = IpNet::parse(&r.prefix)?;
            net.contains(destination).then(|| r.clone())
        })
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
