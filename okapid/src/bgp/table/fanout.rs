use std::collections::{BTreeMap, VecDeque};

use crate::bgp::route::{AddressFamily, InternalMessage, PeerId, RouteArena, RouteId};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp};

/// Queued work for one branch; routes are the branch's own arena clones.
#[derive(Debug)]
enum RouteQueueEntry<A: AddressFamily> {
    Add(InternalMessage<A>),
    Replace(InternalMessage<A>, InternalMessage<A>),
    Delete(InternalMessage<A>),
    Dump(InternalMessage<A>),
    Push,
}

#[derive(Debug)]
struct Branch<A: AddressFamily> {
    next: TableId,
    queue: VecDeque<RouteQueueEntry<A>>,
    busy: bool,
}

/// One-to-many replication point. Every branch gets its own FIFO so a
/// slow peer throttles only itself; a route is finished here only once
/// every branch has either queued or rejected it.
#[derive(Debug)]
pub struct FanoutTable<A: AddressFamily> {
    id: TableId,
    parent: TableId,
    branches: BTreeMap<PeerId, Branch<A>>,
}

impl<A: AddressFamily> FanoutTable<A> {
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            parent: 0,
            branches: BTreeMap::new(),
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn add_branch(&mut self, peer: PeerId, next: TableId) {
        self.branches.insert(
            peer,
            Branch {
                next,
                queue: VecDeque::new(),
                busy: false,
            },
        );
    }

    /// Remove the branch, freeing anything still parked in its queue.
    pub fn remove_branch(&mut self, peer: PeerId, arena: &mut RouteArena<A>) {
        let Some(branch) = self.branches.remove(&peer) else {
            return;
        };
        for entry in branch.queue {
            match entry {
                RouteQueueEntry::Add(msg)
                | RouteQueueEntry::Delete(msg)
                | RouteQueueEntry::Dump(msg) => arena.free(msg.id),
                RouteQueueEntry::Replace(old, new) => {
                    arena.free(old.id);
                    arena.free(new.id);
                }
                RouteQueueEntry::Push => {}
            }
        }
    }

    pub fn queue_len(&self, peer: PeerId) -> usize {
        self.branches.get(&peer).map(|b| b.queue.len()).unwrap_or(0)
    }

    pub fn output_busy(&mut self, peer: PeerId) {
        if let Some(branch) = self.branches.get_mut(&peer) {
            branch.busy = true;
        }
    }

    /// Backpressure released: drain the branch until empty or busy again.
    pub fn output_no_longer_busy(
        &mut self,
        ctx: &mut Ctx<A>,
        peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        if let Some(branch) = self.branches.get_mut(&peer) {
            branch.busy = false;
        }
        let mut ops = Vec::new();
        while self.get_next_message(ctx, peer, &mut ops)? {}
        Ok(ops)
    }

    /// Pull-mode: hand one queued entry to the branch's downstream.
    /// Returns false when the queue is empty or the branch is busy.
    pub fn get_next_message(
        &mut self,
        ctx: &mut Ctx<A>,
        peer: PeerId,
        ops: &mut Vec<TableOp<A>>,
    ) -> Result<bool> {
        let Some(branch) = self.branches.get_mut(&peer) else {
            return Ok(false);
        };
        if branch.busy {
            return Ok(false);
        }
        let Some(entry) = branch.queue.pop_front() else {
            return Ok(false);
        };
        let to = branch.next;
        let caller = self.id;
        match entry {
            RouteQueueEntry::Add(msg) => {
                ctx.out.free_after.push(msg.id);
                ops.push(TableOp::Add { to, caller, msg });
            }
            RouteQueueEntry::Replace(old, new) => {
                ctx.out.free_after.push(old.id);
                ctx.out.free_after.push(new.id);
                ops.push(TableOp::Replace {
                    to,
                    caller,
                    old,
                    new,
                });
            }
            RouteQueueEntry::Delete(msg) => {
                ctx.out.free_after.push(msg.id);
                ops.push(TableOp::Delete { to, caller, msg });
            }
            RouteQueueEntry::Dump(msg) => {
                ctx.out.free_after.push(msg.id);
                ops.push(TableOp::Dump {
                    to,
                    caller,
                    msg,
                    dump_peer: peer,
                });
            }
            RouteQueueEntry::Push => {
                ops.push(TableOp::Push { to, caller });
            }
        }
        Ok(true)
    }

    fn clone_msg(ctx: &mut Ctx<A>, msg: &InternalMessage<A>) -> InternalMessage<A> {
        let mut copy = msg.clone();
        copy.id = ctx.arena.clone_entry(msg.id);
        copy
    }

    fn enqueue_and_drain(
        &mut self,
        ctx: &mut Ctx<A>,
        peer: PeerId,
        entry: RouteQueueEntry<A>,
    ) -> Result<Vec<TableOp<A>>> {
        if let Some(branch) = self.branches.get_mut(&peer) {
            branch.queue.push_back(entry);
        }
        let mut ops = Vec::new();
        while self.get_next_message(ctx, peer, &mut ops)? {}
        Ok(ops)
    }

    fn peer_list(&self) -> Vec<PeerId> {
        self.branches.keys().copied().collect()
    }

    pub fn release(self, arena: &mut RouteArena<A>) {
        for branch in self.branches.into_values() {
            for entry in branch.queue {
                match entry {
                    RouteQueueEntry::Add(msg)
                    | RouteQueueEntry::Delete(msg)
                    | RouteQueueEntry::Dump(msg) => arena.free(msg.id),
                    RouteQueueEntry::Replace(old, new) => {
                        arena.free(old.id);
                        arena.free(new.id);
                    }
                    RouteQueueEntry::Push => {}
                }
            }
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for FanoutTable<A> {
    fn name(&self) -> String {
        "fanout".to_string()
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if caller != self.parent {
            return Err(CoreError::fatal(format!(
                "fanout: caller {} is not parent {}",
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
        let mut ops = Vec::new();
        for peer in self.peer_list() {
            // Split horizon: never hand a route back to its origin.
            if peer == msg.origin {
                continue;
            }
            let copy = Self::clone_msg(ctx, &msg);
            ctx.out.delivered = true;
            ops.extend(self.enqueue_and_drain(ctx, peer, RouteQueueEntry::Add(copy))?);
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
        let mut ops = Vec::new();
        for peer in self.peer_list() {
            // When the winner moved between peers, the branches at the
            // two ends see only their half of the change.
            let entry = if peer == new.origin && peer == old.origin {
                continue;
            } else if peer == new.origin {
                RouteQueueEntry::Delete(Self::clone_msg(ctx, &old))
            } else if peer == old.origin {
                RouteQueueEntry::Add(Self::clone_msg(ctx, &new))
            } else {
                RouteQueueEntry::Replace(Self::clone_msg(ctx, &old), Self::clone_msg(ctx, &new))
            };
            ctx.out.delivered = true;
            ops.extend(self.enqueue_and_drain(ctx, peer, entry)?);
        }
        Ok(ops)
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        let mut ops = Vec::new();
        for peer in self.peer_list() {
            if peer == msg.origin {
                continue;
            }
            let copy = Self::clone_msg(ctx, &msg);
            ops.extend(self.enqueue_and_drain(ctx, peer, RouteQueueEntry::Delete(copy))?);
        }
        Ok(ops)
    }

    fn push(&mut self, ctx: &mut Ctx<A>, _caller: TableId) -> Result<Vec<TableOp<A>>> {
        let mut ops = Vec::new();
        for peer in self.peer_list() {
            ops.extend(self.enqueue_and_drain(ctx, peer, RouteQueueEntry::Push)?);
        }
        Ok(ops)
    }

    fn route_dump(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        if dump_peer == msg.origin {
            return Ok(Vec::new());
        }
        let copy = Self::clone_msg(ctx, &msg);
        ctx.out.delivered = true;
        self.enqueue_and_drain(ctx, dump_peer, RouteQueueEntry::Dump(copy))
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, _net: &A::Net) -> Option<(RouteId, u32)> {
        None
    }
}
