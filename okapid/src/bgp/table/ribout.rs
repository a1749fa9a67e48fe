use std::sync::Arc;

use bgp_wire::{ClusterList, LocalPref, OriginatorId, PathAttrs};

use crate::bgp::route::{
    AddressFamily, InternalMessage, PeerId, PeerInfo, PeerKind, RouteArena, RouteId,
};
use crate::error::{CoreError, Result};

use super::{Ctx, Outbound, PipelineConfig, RouteTable, TableId, TableOp, LOCAL_PEER};

/// Tail of an egress chain: applies the per-peer mechanical rewrites
/// (next-hop self, LOCAL_PREF handling, AS prepend, route reflection)
/// and batches the results until the next push flushes them to the peer
/// handler for UPDATE assembly.
#[derive(Debug)]
pub struct RibOutTable<A: AddressFamily> {
    id: TableId,
    peer: PeerId,
    parent: TableId,
    /// Local address of the session, for next-hop-self rewrites.
    local_nexthop: Option<A::Addr>,
    queue: Vec<OutChange<A>>,
}

#[derive(Debug)]
enum OutChange<A: AddressFamily> {
    Announce(A::Net, Arc<PathAttrs>),
    Withdraw(A::Net),
}

impl<A: AddressFamily> RibOutTable<A> {
    pub fn new(id: TableId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            parent: 0,
            local_nexthop: None,
            queue: Vec::new(),
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn set_local_nexthop(&mut self, addr: A::Addr) {
        self.local_nexthop = Some(addr);
    }

    /// Outbound attribute surgery for this peer. None means the route
    /// must not be advertised on this session at all.
    fn prepare_attrs(
        &self,
        config: &PipelineConfig,
        target: &PeerInfo,
        origin_kind: Option<PeerKind>,
        origin_info: Option<&PeerInfo>,
        attrs: &PathAttrs,
    ) -> Option<PathAttrs> {
        if let Some(com) = &attrs.community {
            if com.is_no_advertise() {
                return None;
            }
            if com.is_no_export() && !target.kind.is_ibgp() {
                return None;
            }
        }

        let mut out = attrs.clone();
        match target.kind {
            PeerKind::Ebgp => {
                // External: prepend ourselves, rewrite the next hop to
                // the session address, and strip internal-only baggage.
                if let Some(aspath) = out.aspath.as_mut() {
                    aspath.prepend(config.local_as);
                }
                if let Some(nexthop) = self.local_nexthop {
                    A::set_nexthop(&mut out, nexthop);
                }
                out.local_pref = None;
                out.originator_id = None;
                out.cluster_list = None;
            }
            PeerKind::Ibgp | PeerKind::Confed => {
                match origin_kind {
                    Some(PeerKind::Ibgp) | Some(PeerKind::Confed) => {
                        // IBGP-learned toward IBGP: legal only through
                        // reflection (RFC 4456), and only between a
                        // client and the rest of the cluster.
                        let origin_client =
                            origin_info.map(|i| i.reflector_client).unwrap_or(false);
                        if !origin_client && !target.reflector_client {
                            return None;
                        }
                        let originator = out.originator_id.map(|o| o.id).or_else(|| {
                            origin_info.map(|i| i.router_id)
                        });
                        out.originator_id = originator.map(OriginatorId::new);
                        let cluster_list =
                            out.cluster_list.get_or_insert_with(ClusterList::new);
                        if cluster_list.contains(&config.cluster_id) {
                            return None;
                        }
                        cluster_list.prepend(config.cluster_id);
                    }
                    _ => {}
                }
                if out.local_pref.is_none() {
                    out.local_pref = Some(LocalPref::new(config.default_local_pref));
                }
                if A::nexthop(&out).is_none() {
                    if let Some(nexthop) = self.local_nexthop {
                        A::set_nexthop(&mut out, nexthop);
                    }
                }
            }
        }
        // Locally synthesized routes (aggregates) always need a next hop.
        if origin_kind.is_none() && A::nexthop(&out).is_none() {
            let nexthop = self.local_nexthop?;
            A::set_nexthop(&mut out, nexthop);
        }
        Some(out)
    }

    fn announce(&mut self, ctx: &mut Ctx<A>, msg: &InternalMessage<A>) -> Result<()> {
        let target = ctx
            .peers
            .get(&self.peer)
            .ok_or_else(|| CoreError::fatal(format!("ribout without peer {}", self.peer)))?;
        let origin_info = if msg.origin == LOCAL_PEER {
            None
        } else {
            ctx.peers.get(&msg.origin)
        };
        let attrs = &ctx.arena.get(msg.id).attrs;
        let prepared = self.prepare_attrs(
            ctx.config,
            target,
            origin_info.map(|i| i.kind),
            origin_info,
            attrs,
        );
        match prepared {
            Some(out) => {
                ctx.out.delivered = true;
                self.queue.push(OutChange::Announce(msg.net, Arc::new(out)));
            }
            None => {
                // Was anything advertised before? The withdraw keeps the
                // peer consistent; harmless if nothing was.
                self.queue.push(OutChange::Withdraw(msg.net));
            }
        }
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl<A: AddressFamily> RouteTable<A> for RibOutTable<A> {
    fn name(&self) -> String {
        format!("ribout({})", self.peer)
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if caller != self.parent {
            return Err(CoreError::fatal(format!(
                "{}: caller {} is not parent {}",
                self.name(),
                caller,
                self.parent
            )));
        }
        Ok(())
    }

    fn add_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        self.announce(ctx, &msg)?;
        Ok(Vec::new())
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        _old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        // An announce for the same NLRI implicitly replaces; no explicit
        // withdraw precedes it on the wire.
        self.announce(ctx, &new)?;
        Ok(Vec::new())
    }

    fn delete_route(
        &mut self,
        _ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        self.queue.push(OutChange::Withdraw(msg.net));
        Ok(Vec::new())
    }

    fn push(&mut self, ctx: &mut Ctx<A>, _caller: TableId) -> Result<Vec<TableOp<A>>> {
        if self.queue.is_empty() {
            return Ok(Vec::new());
        }
        for change in self.queue.drain(..) {
            match change {
                OutChange::Announce(net, attrs) => ctx.out.outbound.push(Outbound::Update {
                    peer: self.peer,
                    net,
                    attrs,
                }),
                OutChange::Withdraw(net) => ctx.out.outbound.push(Outbound::Withdraw {
                    peer: self.peer,
                    net,
                }),
            }
        }
        ctx.out.outbound.push(Outbound::Push { peer: self.peer });
        Ok(Vec::new())
    }

    fn route_dump(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
        _dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        self.announce(ctx, &msg)?;
        Ok(Vec::new())
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, _net: &A::Net) -> Option<(RouteId, u32)> {
        None
    }
}
