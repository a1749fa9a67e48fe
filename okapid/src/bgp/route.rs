use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use bitflags::bitflags;
use bgp_wire::{Afi, MpNexthop, NexthopAttr, PathAttrs};
use ipnet::{Ipv4Net, Ipv6Net};
use prefix_trie::Prefix;

/// Address-family plug for the pipeline. The whole route machinery is
/// written once against this trait and instantiated for v4 and v6.
pub trait AddressFamily: Sized + Send + fmt::Debug + 'static {
    type Addr: Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug + Send;
    type Net: Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug + Send + Prefix;

    const AFI: Afi;
    const BITLEN: u8;

    fn zero_addr() -> Self::Addr;
    fn is_unicast(addr: &Self::Addr) -> bool;
    fn is_multicast(addr: &Self::Addr) -> bool;
    fn is_linklocal_multicast(addr: &Self::Addr) -> bool;

    fn to_ip(addr: &Self::Addr) -> IpAddr;
    fn from_ip(addr: IpAddr) -> Option<Self::Addr>;

    fn net_contains(outer: &Self::Net, inner: &Self::Net) -> bool;
    fn net_prefix_len(net: &Self::Net) -> u8;

    /// Next hop of a path-attribute list in this family's terms.
    fn nexthop(attrs: &PathAttrs) -> Option<Self::Addr>;
    fn set_nexthop(attrs: &mut PathAttrs, addr: Self::Addr);
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Af;

impl AddressFamily for Ipv4Af {
    type Addr = Ipv4Addr;
    type Net = Ipv4Net;

    const AFI: Afi = Afi::Ip;
    const BITLEN: u8 = 32;

    fn zero_addr() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    fn is_unicast(addr: &Ipv4Addr) -> bool {
        !addr.is_multicast() && !addr.is_broadcast() && !addr.is_unspecified()
    }

    fn is_multicast(addr: &Ipv4Addr) -> bool {
        addr.is_multicast()
    }

    fn is_linklocal_multicast(addr: &Ipv4Addr) -> bool {
        // 224.0.0.0/24 is never routed.
        addr.octets()[0] == 224 && addr.octets()[1] == 0 && addr.octets()[2] == 0
    }

    fn to_ip(addr: &Ipv4Addr) -> IpAddr {
        IpAddr::V4(*addr)
    }

    fn from_ip(addr: IpAddr) -> Option<Ipv4Addr> {
        match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }

    fn net_contains(outer: &Ipv4Net, inner: &Ipv4Net) -> bool {
        outer.contains(inner)
    }

    fn net_prefix_len(net: &Ipv4Net) -> u8 {
        net.prefix_len()
    }

    fn nexthop(attrs: &PathAttrs) -> Option<Ipv4Addr> {
        attrs.nexthop_v4()
    }

    fn set_nexthop(attrs: &mut PathAttrs, addr: Ipv4Addr) {
        attrs.nexthop = Some(NexthopAttr::new(addr));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv6Af;

impl AddressFamily for Ipv6Af {
    type Addr = Ipv6Addr;
    type Net = Ipv6Net;

    const AFI: Afi = Afi::Ip6;
    const BITLEN: u8 = 128;

    fn zero_addr() -> Ipv6Addr {
        Ipv6Addr::UNSPECIFIED
    }

    fn is_unicast(addr: &Ipv6Addr) -> bool {
        !addr.is_multicast() && !addr.is_unspecified()
    }

    fn is_multicast(addr: &Ipv6Addr) -> bool {
        addr.is_multicast()
    }

    fn is_linklocal_multicast(addr: &Ipv6Addr) -> bool {
        // ff02::/16 scope.
        addr.segments()[0] & 0xff0f == 0xff02
    }

    fn to_ip(addr: &Ipv6Addr) -> IpAddr {
        IpAddr::V6(*addr)
    }

    fn from_ip(addr: IpAddr) -> Option<Ipv6Addr> {
        match addr {
            IpAddr::V4(_) => None,
            IpAddr::V6(v6) => Some(v6),
        }
    }

    fn net_contains(outer: &Ipv6Net, inner: &Ipv6Net) -> bool {
        outer.contains(inner)
    }

    fn net_prefix_len(net: &Ipv6Net) -> u8 {
        net.prefix_len()
    }

    fn nexthop(attrs: &PathAttrs) -> Option<Ipv6Addr> {
        match attrs.mp_nexthop {
            Some(MpNexthop::Ipv6 { global, .. }) => Some(global),
            _ => None,
        }
    }

    fn set_nexthop(attrs: &mut PathAttrs, addr: Ipv6Addr) {
        attrs.mp_nexthop = Some(MpNexthop::Ipv6 {
            global: addr,
            linklocal: None,
        });
    }
}

/// Compact peer handle used throughout the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Ibgp,
    Ebgp,
    /// Confederation member AS peer (RFC 5065): external transport,
    /// internal tie-break treatment.
    Confed,
}

impl PeerKind {
    pub fn is_ibgp(&self) -> bool {
        matches!(self, PeerKind::Ibgp)
    }

    pub fn is_ebgp(&self) -> bool {
        matches!(self, PeerKind::Ebgp)
    }
}

/// Peer facts the decision process needs.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: IpAddr,
    pub kind: PeerKind,
    pub neighbor_as: u32,
    pub router_id: Ipv4Addr,
    pub reflector_client: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouteFlags: u8 {
        const WINNER = 0x01;
        const FILTERED = 0x02;
        const NEXTHOP_RESOLVED = 0x04;
        const IN_USE = 0x08;
        const AGGREGATED = 0x10;
    }
}

/// Index of the per-stage policy-filter slot on a route.
pub const POLICY_IMPORT: usize = 0;
pub const POLICY_SOURCE_MATCH: usize = 1;
pub const POLICY_EXPORT: usize = 2;

/// A stored route: prefix plus shared path attributes plus flags. Lives
/// in a `RouteArena` slot; everything else refers to it by `RouteId`.
#[derive(Debug)]
pub struct SubnetRoute<A: AddressFamily> {
    pub net: A::Net,
    pub attrs: Arc<PathAttrs>,
    pub flags: RouteFlags,
    /// Cached per-stage filter results (import, source-match, export).
    pub policy_attrs: [Option<Arc<PathAttrs>>; 3],
    pub igp_metric: Option<u32>,
}

impl<A: AddressFamily> Clone for SubnetRoute<A> {
    fn clone(&self) -> Self {
        Self {
            net: self.net,
            attrs: self.attrs.clone(),
            flags: self.flags,
            policy_attrs: self.policy_attrs.clone(),
            igp_metric: self.igp_metric,
        }
    }
}

impl<A: AddressFamily> SubnetRoute<A> {
    pub fn new(net: A::Net, attrs: Arc<PathAttrs>) -> Self {
        Self {
            net,
            attrs,
            flags: RouteFlags::default(),
            policy_attrs: [None, None, None],
            igp_metric: None,
        }
    }

    pub fn nexthop(&self) -> Option<A::Addr> {
        A::nexthop(&self.attrs)
    }
}

/// Route slot handle. Valid until the owning arena frees the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteId(u32);

/// Index-based route storage. One arena per address family per node:
/// internal messages and tables hold `RouteId`s instead of pointers, and
/// a route's lifetime ends with an explicit free on withdraw.
#[derive(Debug)]
pub struct RouteArena<A: AddressFamily> {
    slots: Vec<Option<SubnetRoute<A>>>,
    free: Vec<u32>,
    live: usize,
}

impl<A: AddressFamily> RouteArena<A> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, route: SubnetRoute<A>) -> RouteId {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(route);
            RouteId(idx)
        } else {
            self.slots.push(Some(route));
            RouteId((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: RouteId) -> &SubnetRoute<A> {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("route slot freed while referenced")
    }

    pub fn get_mut(&mut self, id: RouteId) -> &mut SubnetRoute<A> {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("route slot freed while referenced")
    }

    /// Copy-on-write for filters that modify: a modified route becomes a
    /// fresh arena entry so the original stays untouched upstream.
    pub fn clone_entry(&mut self, id: RouteId) -> RouteId {
        let route = self.get(id).clone();
        self.alloc(route)
    }

    pub fn free(&mut self, id: RouteId) {
        if self.slots[id.0 as usize].take().is_some() {
            self.live -= 1;
            self.free.push(id.0);
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<A: AddressFamily> Default for RouteArena<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Transient envelope for one pipeline traversal.
#[derive(Debug)]
pub struct InternalMessage<A: AddressFamily> {
    pub id: RouteId,
    pub net: A::Net,
    pub origin: PeerId,
    pub genid: u32,
    pub push: bool,
    pub changed: bool,
    pub copied: bool,
    pub from_previous_peering: bool,
}

impl<A: AddressFamily> Clone for InternalMessage<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            net: self.net,
            origin: self.origin,
            genid: self.genid,
            push: self.push,
            changed: self.changed,
            copied: self.copied,
            from_previous_peering: self.from_previous_peering,
        }
    }
}

impl<A: AddressFamily> InternalMessage<A> {
    pub fn new(id: RouteId, net: A::Net, origin: PeerId, genid: u32) -> Self {
        Self {
            id,
            net,
            origin,
            genid,
            push: false,
            changed: false,
            copied: false,
            from_previous_peering: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_wire::{AsPath, Origin};

    fn attrs() -> Arc<PathAttrs> {
        let mut pa = PathAttrs::new();
        pa.origin = Some(Origin::Igp);
        pa.aspath = Some(AsPath::from_sequence([65001]));
        pa.nexthop = Some(NexthopAttr::new(Ipv4Addr::new(10, 0, 0, 1)));
        Arc::new(pa)
    }

    #[test]
    fn arena_alloc_free_reuse() {
        let mut arena: RouteArena<Ipv4Af> = RouteArena::new();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let a = arena.alloc(SubnetRoute::new(net, attrs()));
        let b = arena.clone_entry(a);
        assert_eq!(arena.len(), 2);
        assert_ne!(a, b);
        assert_eq!(arena.get(a).net, arena.get(b).net);

        arena.free(a);
        assert_eq!(arena.len(), 1);
        let c = arena.alloc(SubnetRoute::new(net, attrs()));
        // Slot of `a` is reused.
        assert_eq!(a, c);
    }

    #[test]
    fn linklocal_multicast_predicates() {
        assert!(Ipv4Af::is_linklocal_multicast(&"224.0.0.5".parse().unwrap()));
        assert!(!Ipv4Af::is_linklocal_multicast(&"239.1.1.1".parse().unwrap()));
        assert!(Ipv6Af::is_linklocal_multicast(&"ff02::1".parse().unwrap()));
        assert!(!Ipv6Af::is_linklocal_multicast(&"ff0e::1".parse().unwrap()));
    }
}
