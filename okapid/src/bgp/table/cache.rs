use std::collections::HashMap;

use crate::bgp::route::{AddressFamily, InternalMessage, PeerId, RouteArena, RouteId};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp};

/// Per-branch storage behind the fanout: keeps its own copy of every
/// route advertised down this branch so the export stages always see a
/// stable reference, and collapses repeated identical announcements.
#[derive(Debug)]
pub struct CacheTable<A: AddressFamily> {
    id: TableId,
    peer: PeerId,
    parent: TableId,
    next: TableId,
    store: HashMap<A::Net, StoredEntry>,
}

#[derive(Debug, Clone, Copy)]
struct StoredEntry {
    id: RouteId,
    genid: u32,
}

impl<A: AddressFamily> CacheTable<A> {
    pub fn new(id: TableId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            parent: 0,
            next: 0,
            store: HashMap::new(),
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn route_count(&self) -> usize {
        self.store.len()
    }

    /// Store our clone; the forwarded message references the stored
    /// entry, which outlives the traversal.
    fn store(&mut self, ctx: &mut Ctx<A>, msg: &InternalMessage<A>) -> InternalMessage<A> {
        let clone = ctx.arena.clone_entry(msg.id);
        if let Some(prev) = self.store.insert(
            msg.net,
            StoredEntry {
                id: clone,
                genid: msg.genid,
            },
        ) {
            ctx.out.free_after.push(prev.id);
        }
        let mut out = msg.clone();
        out.id = clone;
        out
    }

    fn stored_same(&self, ctx: &Ctx<A>, msg: &InternalMessage<A>) -> bool {
        let Some(entry) = self.store.get(&msg.net) else {
            return false;
        };
        ctx.arena.get(entry.id).attrs == ctx.arena.get(msg.id).attrs
    }

    pub fn release(self, arena: &mut RouteArena<A>) {
        for entry in self.store.into_values() {
            arena.free(entry.id);
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for CacheTable<A> {
    fn name(&self) -> String {
        format!("cache({})", self.peer)
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
        if self.stored_same(ctx, &msg) {
            // Identical to what this branch already advertised.
            return Ok(Vec::new());
        }
        let old_entry = self.store.get(&msg.net).copied();
        let out = self.store(ctx, &msg);
        match old_entry {
            // Replace semantics toward the peer.
            Some(old_entry) => {
                let old_msg =
                    InternalMessage::new(old_entry.id, msg.net, msg.origin, old_entry.genid);
                Ok(vec![TableOp::Replace {
                    to: self.next,
                    caller: self.id,
                    old: old_msg,
                    new: out,
                }])
            }
            None => Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg: out,
            }]),
        }
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        _old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        if self.stored_same(ctx, &new) {
            return Ok(Vec::new());
        }
        let old_entry = self.store.get(&new.net).copied();
        let out = self.store(ctx, &new);
        match old_entry {
            Some(old_entry) => {
                let old_msg =
                    InternalMessage::new(old_entry.id, new.net, new.origin, old_entry.genid);
                Ok(vec![TableOp::Replace {
                    to: self.next,
                    caller: self.id,
                    old: old_msg,
                    new: out,
                }])
            }
            None => Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg: out,
            }]),
        }
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        let Some(entry) = self.store.remove(&msg.net) else {
            // This branch never advertised the prefix.
            return Ok(Vec::new());
        };
        ctx.out.free_after.push(entry.id);
        let out = InternalMessage::new(entry.id, msg.net, msg.origin, entry.genid);
        Ok(vec![TableOp::Delete {
            to: self.next,
            caller: self.id,
            msg: out,
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
        if self.stored_same(ctx, &msg) {
            return Ok(Vec::new());
        }
        let out = self.store(ctx, &msg);
        Ok(vec![TableOp::Dump {
            to: self.next,
            caller: self.id,
            msg: out,
            dump_peer,
        }])
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, net: &A::Net) -> Option<(RouteId, u32)> {
        self.store.get(net).map(|entry| (entry.id, entry.genid))
    }
}
