use std::collections::BTreeMap;
use std::sync::Arc;

use bgp_wire::{Aggregator, AsPath, AtomicAggregate, Origin, PathAttrs};

use crate::bgp::route::{
    AddressFamily, InternalMessage, PeerId, RouteArena, RouteFlags, RouteId, SubnetRoute,
};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp, LOCAL_PEER};

#[derive(Debug)]
struct AggregateEntry<A: AddressFamily> {
    net: A::Net,
    summary_only: bool,
    /// Contributing more-specific routes, by prefix.
    components: BTreeMap<A::Net, Origin>,
    /// Our own arena entry for the synthesized route, while advertised.
    advertised: Option<RouteId>,
}

/// RFC 4271 section 9.2.2.2 aggregation: configured aggregate prefixes
/// absorb their more-specifics. The aggregate is synthesized locally
/// with ATOMIC_AGGREGATE and AGGREGATOR; with summary-only the
/// contributing routes are withheld from downstream.
#[derive(Debug)]
pub struct AggregationTable<A: AddressFamily> {
    id: TableId,
    parent: TableId,
    next: TableId,
    aggregates: Vec<AggregateEntry<A>>,
}

impl<A: AddressFamily> AggregationTable<A> {
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            parent: 0,
            next: 0,
            aggregates: Vec::new(),
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn add_aggregate(&mut self, net: A::Net, summary_only: bool) {
        if self.aggregates.iter().any(|a| a.net == net) {
            return;
        }
        self.aggregates.push(AggregateEntry {
            net,
            summary_only,
            components: BTreeMap::new(),
            advertised: None,
        });
    }

    fn covering(&mut self, net: &A::Net) -> Option<usize> {
        self.aggregates
            .iter()
            .position(|a| a.net != *net && A::net_contains(&a.net, net))
    }

    /// Merged attribute set for an aggregate: worst ORIGIN of the
    /// components, empty AS path, ATOMIC_AGGREGATE and our AGGREGATOR.
    fn synthesize(ctx: &Ctx<A>, entry: &AggregateEntry<A>) -> PathAttrs {
        let mut origin = Origin::Igp;
        for component_origin in entry.components.values() {
            origin = origin.max(*component_origin);
        }
        let mut attrs = PathAttrs::new();
        attrs.origin = Some(origin);
        attrs.aspath = Some(AsPath::new());
        attrs.atomic_aggregate = Some(AtomicAggregate);
        attrs.aggregator = Some(Aggregator::new(
            ctx.config.local_as,
            ctx.config.router_id,
        ));
        attrs
    }

    /// Re-derive the aggregate after a component change and emit the
    /// downstream delta for the aggregate prefix itself.
    fn refresh(&mut self, ctx: &mut Ctx<A>, idx: usize) -> Vec<TableOp<A>> {
        let entry = &mut self.aggregates[idx];
        let old = entry.advertised.take();
        if entry.components.is_empty() {
            if let Some(old_id) = old {
                ctx.out.free_after.push(old_id);
                let msg = InternalMessage::new(old_id, entry.net, LOCAL_PEER, 0);
                return vec![TableOp::Delete {
                    to: self.next,
                    caller: self.id,
                    msg,
                }];
            }
            return Vec::new();
        }

        let attrs = Arc::new(Self::synthesize(ctx, entry));
        let mut route = SubnetRoute::<A>::new(entry.net, attrs.clone());
        // Locally synthesized: nothing to resolve.
        route.flags.insert(RouteFlags::NEXTHOP_RESOLVED | RouteFlags::AGGREGATED);
        let new_id = ctx.arena.alloc(route);
        entry.advertised = Some(new_id);
        let new_msg = InternalMessage::new(new_id, entry.net, LOCAL_PEER, 0);

        match old {
            Some(old_id) => {
                if ctx.arena.get(old_id).attrs == attrs {
                    // Unchanged; keep the fresh entry, drop the old one.
                    ctx.arena.free(old_id);
                    return Vec::new();
                }
                ctx.out.free_after.push(old_id);
                let old_msg = InternalMessage::new(old_id, entry.net, LOCAL_PEER, 0);
                vec![TableOp::Replace {
                    to: self.next,
                    caller: self.id,
                    old: old_msg,
                    new: new_msg,
                }]
            }
            None => vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg: new_msg,
            }],
        }
    }

    pub fn release(self, arena: &mut RouteArena<A>) {
        for entry in self.aggregates {
            if let Some(id) = entry.advertised {
                arena.free(id);
            }
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for AggregationTable<A> {
    fn name(&self) -> String {
        "aggregation".to_string()
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if caller != self.parent {
            return Err(CoreError::fatal(format!(
                "aggregation: caller {} is not parent {}",
                caller, self.parent
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
        let Some(idx) = self.covering(&msg.net) else {
            return Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg,
            }]);
        };
        let origin = ctx.arena.get(msg.id).attrs.origin_or_incomplete();
        self.aggregates[idx].components.insert(msg.net, origin);
        let summary_only = self.aggregates[idx].summary_only;
        let mut ops = self.refresh(ctx, idx);
        if summary_only {
            // The more-specific is absorbed into the aggregate.
            ctx.arena.get_mut(msg.id).flags.insert(RouteFlags::AGGREGATED);
        } else {
            ops.push(TableOp::Add {
                to: self.next,
                caller: self.id,
                msg,
            });
        }
        Ok(ops)
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        let Some(idx) = self.covering(&new.net) else {
            return Ok(vec![TableOp::Replace {
                to: self.next,
                caller: self.id,
                old,
                new,
            }]);
        };
        let origin = ctx.arena.get(new.id).attrs.origin_or_incomplete();
        self.aggregates[idx].components.insert(new.net, origin);
        let summary_only = self.aggregates[idx].summary_only;
        let mut ops = self.refresh(ctx, idx);
        if !summary_only {
            ops.push(TableOp::Replace {
                to: self.next,
                caller: self.id,
                old,
                new,
            });
        }
        Ok(ops)
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        let Some(idx) = self.covering(&msg.net) else {
            return Ok(vec![TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg,
            }]);
        };
        self.aggregates[idx].components.remove(&msg.net);
        let summary_only = self.aggregates[idx].summary_only;
        let mut ops = self.refresh(ctx, idx);
        if !summary_only {
            ops.push(TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg,
            });
        }
        Ok(ops)
    }

    fn push(&mut self, _ctx: &mut Ctx<A>, _caller: TableId) -> Result<Vec<TableOp<A>>> {
        Ok(vec![TableOp::Push {
            to: self.next,
            caller: self.id,
        }])
    }

    fn route_dump(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        let Some(idx) = self.covering(&msg.net) else {
            return Ok(vec![TableOp::Dump {
                to: self.next,
                caller: self.id,
                msg,
                dump_peer,
            }]);
        };
        let mut ops = Vec::new();
        // The aggregate itself lives in no RIB-In, so a component dump
        // re-offers it; the egress cache absorbs the duplicates.
        if let Some(adv) = self.aggregates[idx].advertised {
            let agg_msg = InternalMessage::new(adv, self.aggregates[idx].net, LOCAL_PEER, 0);
            ops.push(TableOp::Dump {
                to: self.next,
                caller: self.id,
                msg: agg_msg,
                dump_peer,
            });
        }
        if !self.aggregates[idx].summary_only {
            ops.push(TableOp::Dump {
                to: self.next,
                caller: self.id,
                msg,
                dump_peer,
            });
        }
        Ok(ops)
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, net: &A::Net) -> Option<(RouteId, u32)> {
        self.aggregates
            .iter()
            .find(|a| a.net == *net)
            .and_then(|a| a.advertised)
            .map(|id| (id, 0))
    }
}
