use std::collections::HashMap;

use crate::bgp::route::{AddressFamily, InternalMessage, PeerId, RouteArena, RouteFlags, RouteId};
use crate::error::{CoreError, Result};
use crate::rib::LookupState;

use super::{Ctx, RouteTable, TableId, TableOp};

#[derive(Debug)]
enum QueueKind {
    Add,
    /// The replace's old half already went downstream; kept (as our own
    /// clone) so the eventual propagation is a replace, not an add.
    Replace { old: RouteId },
}

#[derive(Debug)]
struct QueueEntry<A: AddressFamily> {
    kind: QueueKind,
    net: A::Net,
    id: RouteId,
    origin: PeerId,
    genid: u32,
}

/// Holds routes whose next hop the RIB has not answered yet. At most one
/// outstanding resolver query per next hop; the queue entry's kind
/// decides how the route propagates once the answer lands.
#[derive(Debug)]
pub struct NhLookupTable<A: AddressFamily> {
    id: TableId,
    parent: TableId,
    next: TableId,
    pending: HashMap<A::Addr, Vec<QueueEntry<A>>>,
    by_net: HashMap<A::Net, A::Addr>,
}

impl<A: AddressFamily> NhLookupTable<A> {
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            parent: 0,
            next: 0,
            pending: HashMap::new(),
            by_net: HashMap::new(),
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn pending_count(&self) -> usize {
        self.by_net.len()
    }

    fn enqueue(&mut self, nexthop: A::Addr, entry: QueueEntry<A>) {
        self.by_net.insert(entry.net, nexthop);
        self.pending.entry(nexthop).or_default().push(entry);
    }

    fn dequeue(&mut self, net: &A::Net) -> Option<(A::Addr, QueueEntry<A>)> {
        let nexthop = self.by_net.remove(net)?;
        let list = self.pending.get_mut(&nexthop)?;
        let pos = list.iter().position(|e| e.net == *net)?;
        let entry = list.remove(pos);
        if list.is_empty() {
            self.pending.remove(&nexthop);
        }
        Some((nexthop, entry))
    }

    fn mark_resolved(ctx: &mut Ctx<A>, id: RouteId, resolvable: bool) {
        let metric = {
            let route = ctx.arena.get(id);
            route.nexthop().and_then(|nh| ctx.resolver.metric(&nh))
        };
        let route = ctx.arena.get_mut(id);
        route.flags.set(RouteFlags::NEXTHOP_RESOLVED, resolvable);
        route.igp_metric = metric;
    }

    /// The resolver finished (or changed) an answer: propagate everything
    /// that was parked on this next hop.
    pub fn rib_lookup_done(
        &mut self,
        ctx: &mut Ctx<A>,
        addr: A::Addr,
        resolvable: bool,
    ) -> Result<Vec<TableOp<A>>> {
        let Some(entries) = self.pending.remove(&addr) else {
            return Ok(Vec::new());
        };
        let mut ops = Vec::new();
        for entry in entries {
            self.by_net.remove(&entry.net);
            Self::mark_resolved(ctx, entry.id, resolvable);
            let msg = InternalMessage::new(entry.id, entry.net, entry.origin, entry.genid);
            ctx.out.free_after.push(entry.id);
            match entry.kind {
                QueueKind::Add => ops.push(TableOp::Add {
                    to: self.next,
                    caller: self.id,
                    msg,
                }),
                QueueKind::Replace { old } => {
                    let old_msg =
                        InternalMessage::new(old, entry.net, entry.origin, entry.genid);
                    ctx.out.free_after.push(old);
                    ops.push(TableOp::Replace {
                        to: self.next,
                        caller: self.id,
                        old: old_msg,
                        new: msg,
                    });
                }
            }
        }
        Ok(ops)
    }

    pub fn release(self, arena: &mut RouteArena<A>, resolver: &mut crate::rib::NextHopResolver<A>) {
        for (nexthop, entries) in self.pending {
            for entry in entries {
                arena.free(entry.id);
                if let QueueKind::Replace { old } = entry.kind {
                    arena.free(old);
                }
                resolver.deregister(&nexthop);
            }
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for NhLookupTable<A> {
    fn name(&self) -> String {
        "nhlookup".to_string()
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if caller != self.parent {
            return Err(CoreError::fatal(format!(
                "nhlookup: caller {} is not parent {}",
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
        let Some(nexthop) = ctx.arena.get(msg.id).nexthop() else {
            // No next hop to resolve (locally synthesized routes).
            return Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg,
            }]);
        };
        match ctx.resolver.register(nexthop) {
            LookupState::Known { resolvable, .. } => {
                Self::mark_resolved(ctx, msg.id, resolvable);
                Ok(vec![TableOp::Add {
                    to: self.next,
                    caller: self.id,
                    msg,
                }])
            }
            LookupState::Pending => {
                let clone = ctx.arena.clone_entry(msg.id);
                self.enqueue(
                    nexthop,
                    QueueEntry {
                        kind: QueueKind::Add,
                        net: msg.net,
                        id: clone,
                        origin: msg.origin,
                        genid: msg.genid,
                    },
                );
                Ok(Vec::new())
            }
        }
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        // A queued entry for this net is updated in place rather than
        // queued twice.
        if let Some((old_nexthop, queued)) = self.dequeue(&new.net) {
            ctx.arena.free(queued.id);
            ctx.resolver.deregister(&old_nexthop);
            let kind = queued.kind;
            let Some(nexthop) = ctx.arena.get(new.id).nexthop() else {
                // Nothing left to resolve; propagate per the queued kind.
                return Ok(match kind {
                    QueueKind::Add => vec![TableOp::Add {
                        to: self.next,
                        caller: self.id,
                        msg: new,
                    }],
                    QueueKind::Replace { old: stored_old } => {
                        let old_msg =
                            InternalMessage::new(stored_old, new.net, new.origin, new.genid);
                        ctx.out.free_after.push(stored_old);
                        vec![TableOp::Replace {
                            to: self.next,
                            caller: self.id,
                            old: old_msg,
                            new,
                        }]
                    }
                });
            };
            match ctx.resolver.register(nexthop) {
                LookupState::Known { resolvable, .. } => {
                    Self::mark_resolved(ctx, new.id, resolvable);
                    return Ok(match kind {
                        // The original add never propagated.
                        QueueKind::Add => vec![TableOp::Add {
                            to: self.next,
                            caller: self.id,
                            msg: new,
                        }],
                        QueueKind::Replace { old: stored_old } => {
                            let old_msg = InternalMessage::new(
                                stored_old, new.net, new.origin, new.genid,
                            );
                            ctx.out.free_after.push(stored_old);
                            vec![TableOp::Replace {
                                to: self.next,
                                caller: self.id,
                                old: old_msg,
                                new,
                            }]
                        }
                    });
                }
                LookupState::Pending => {
                    let clone = ctx.arena.clone_entry(new.id);
                    self.enqueue(
                        nexthop,
                        QueueEntry {
                            kind,
                            net: new.net,
                            id: clone,
                            origin: new.origin,
                            genid: new.genid,
                        },
                    );
                    return Ok(Vec::new());
                }
            }
        }

        // The old half is downstream. Deregister its next hop and decide
        // how the new half travels.
        if let Some(old_nexthop) = ctx.arena.get(old.id).nexthop() {
            ctx.resolver.deregister(&old_nexthop);
        }
        let Some(nexthop) = ctx.arena.get(new.id).nexthop() else {
            return Ok(vec![TableOp::Replace {
                to: self.next,
                caller: self.id,
                old,
                new,
            }]);
        };
        match ctx.resolver.register(nexthop) {
            LookupState::Known { resolvable, .. } => {
                Self::mark_resolved(ctx, new.id, resolvable);
                Ok(vec![TableOp::Replace {
                    to: self.next,
                    caller: self.id,
                    old,
                    new,
                }])
            }
            LookupState::Pending => {
                let old_clone = ctx.arena.clone_entry(old.id);
                let new_clone = ctx.arena.clone_entry(new.id);
                self.enqueue(
                    nexthop,
                    QueueEntry {
                        kind: QueueKind::Replace { old: old_clone },
                        net: new.net,
                        id: new_clone,
                        origin: new.origin,
                        genid: new.genid,
                    },
                );
                Ok(Vec::new())
            }
        }
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        if let Some((nexthop, queued)) = self.dequeue(&msg.net) {
            // The peer withdrew (or deregistered) before resolution
            // completed; drop the parked route and forward the
            // deregistration to the resolver.
            ctx.arena.free(queued.id);
            ctx.resolver.deregister(&nexthop);
            return Ok(match queued.kind {
                QueueKind::Add => Vec::new(),
                QueueKind::Replace { old } => {
                    let old_msg = InternalMessage::new(old, msg.net, msg.origin, msg.genid);
                    ctx.out.free_after.push(old);
                    vec![TableOp::Delete {
                        to: self.next,
                        caller: self.id,
                        msg: old_msg,
                    }]
                }
            });
        }
        if let Some(nexthop) = ctx.arena.get(msg.id).nexthop() {
            ctx.resolver.deregister(&nexthop);
        }
        Ok(vec![TableOp::Delete {
            to: self.next,
            caller: self.id,
            msg,
        }])
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
        let Some(nexthop) = ctx.arena.get(msg.id).nexthop() else {
            return Ok(vec![TableOp::Dump {
                to: self.next,
                caller: self.id,
                msg,
                dump_peer,
            }]);
        };
        // Dumps reuse whatever the live route already established; an
        // unresolved one will reach the new peer when resolution lands.
        match ctx.resolver.lookup(&nexthop) {
            Some((resolvable, _)) => {
                Self::mark_resolved(ctx, msg.id, resolvable);
                Ok(vec![TableOp::Dump {
                    to: self.next,
                    caller: self.id,
                    msg,
                    dump_peer,
                }])
            }
            None => Ok(Vec::new()),
        }
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, _net: &A::Net) -> Option<(RouteId, u32)> {
        self.by_net.get(_net).and_then(|nexthop| {
            self.pending
                .get(nexthop)?
                .iter()
                .find(|e| e.net == *_net)
                .map(|e| (e.id, e.genid))
        })
    }
}
