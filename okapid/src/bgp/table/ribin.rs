use std::sync::Arc;

use bgp_wire::PathAttrs;
use prefix_trie::PrefixMap;

use crate::bgp::route::{AddressFamily, InternalMessage, PeerId, RouteArena, RouteId, SubnetRoute};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp, ENTRY};

/// Per-peer ingress store: the peer's view of what it advertised us,
/// keyed by prefix with replace semantics. Chain head; everything the
/// peer handler feeds in enters here.
#[derive(Debug)]
pub struct RibInTable<A: AddressFamily> {
    id: TableId,
    peer: PeerId,
    genid: u32,
    trie: PrefixMap<A::Net, RouteId>,
    next: TableId,
}

impl<A: AddressFamily> RibInTable<A> {
    pub fn new(id: TableId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            genid: 1,
            trie: PrefixMap::new(),
            next: 0,
        }
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn genid(&self) -> u32 {
        self.genid
    }

    pub fn bump_genid(&mut self) {
        self.genid += 1;
    }

    pub fn route_count(&self) -> usize {
        self.trie.len()
    }

    /// Snapshot of stored prefixes, in trie order. Taken when a dump to a
    /// new peer starts.
    pub fn net_list(&self) -> Vec<A::Net> {
        self.trie.iter().map(|(net, _)| *net).collect()
    }

    fn msg(&self, id: RouteId, net: A::Net) -> InternalMessage<A> {
        InternalMessage::new(id, net, self.peer, self.genid)
    }

    /// An UPDATE announced `net`. Replace semantics on re-announce.
    pub fn ingress_add(
        &mut self,
        ctx: &mut Ctx<A>,
        net: A::Net,
        attrs: Arc<PathAttrs>,
    ) -> Result<Vec<TableOp<A>>> {
        let new_id = ctx.arena.alloc(SubnetRoute::new(net, attrs));
        match self.trie.insert(net, new_id) {
            Some(old_id) => {
                ctx.out.free_after.push(old_id);
                Ok(vec![TableOp::Replace {
                    to: self.next,
                    caller: self.id,
                    old: self.msg(old_id, net),
                    new: self.msg(new_id, net),
                }])
            }
            None => Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg: self.msg(new_id, net),
            }]),
        }
    }

    /// An UPDATE withdrew `net`. Withdraw of something we never stored is
    /// silently ignored, as RFC 4271 requires.
    pub fn ingress_delete(&mut self, ctx: &mut Ctx<A>, net: A::Net) -> Result<Vec<TableOp<A>>> {
        match self.trie.remove(&net) {
            Some(old_id) => {
                ctx.out.free_after.push(old_id);
                Ok(vec![TableOp::Delete {
                    to: self.next,
                    caller: self.id,
                    msg: self.msg(old_id, net),
                }])
            }
            None => Ok(Vec::new()),
        }
    }

    /// Session dropped: sweep everything this peering contributed.
    pub fn peering_went_down(&mut self, ctx: &mut Ctx<A>) -> Result<Vec<TableOp<A>>> {
        let mut ops = Vec::new();
        let entries: Vec<(A::Net, RouteId)> =
            self.trie.iter().map(|(net, id)| (*net, *id)).collect();
        self.trie = PrefixMap::new();
        for (net, id) in entries {
            ctx.out.free_after.push(id);
            let mut msg = self.msg(id, net);
            msg.from_previous_peering = true;
            ops.push(TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg,
            });
        }
        Ok(ops)
    }

    /// Emit one stored route as a dump toward `dump_peer`.
    pub fn dump_one(
        &mut self,
        _ctx: &mut Ctx<A>,
        net: A::Net,
        id: RouteId,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        Ok(vec![TableOp::Dump {
            to: self.next,
            caller: self.id,
            msg: self.msg(id, net),
            dump_peer,
        }])
    }

    pub fn release(self, arena: &mut RouteArena<A>) {
        for (_, id) in self.trie.iter() {
            arena.free(*id);
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for RibInTable<A> {
    fn name(&self) -> String {
        format!("ribin({})", self.peer)
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if caller != ENTRY {
            return Err(CoreError::fatal(format!(
                "{}: downward call from table {}, expected chain entry",
                self.name(),
                caller
            )));
        }
        Ok(())
    }

    fn add_route(
        &mut self,
        _ctx: &mut Ctx<A>,
        _caller: TableId,
        _msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        Err(CoreError::fatal("rib-in takes ingress via the peer handler"))
    }

    fn replace_route(
        &mut self,
        _ctx: &mut Ctx<A>,
        _caller: TableId,
        _old: InternalMessage<A>,
        _new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        Err(CoreError::fatal("rib-in takes ingress via the peer handler"))
    }

    fn delete_route(
        &mut self,
        _ctx: &mut Ctx<A>,
        _caller: TableId,
        _msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        Err(CoreError::fatal("rib-in takes ingress via the peer handler"))
    }

    fn push(&mut self, _ctx: &mut Ctx<A>, _caller: TableId) -> Result<Vec<TableOp<A>>> {
        Ok(vec![TableOp::Push {
            to: self.next,
            caller: self.id,
        }])
    }

    fn route_dump(
        &mut self,
        _ctx: &mut Ctx<A>,
        _caller: TableId,
        _msg: InternalMessage<A>,
        _dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        Err(CoreError::fatal("rib-in is dumped via dump_one"))
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, net: &A::Net) -> Option<(RouteId, u32)> {
        self.trie.get(net).map(|&id| (id, self.genid))
    }
}
