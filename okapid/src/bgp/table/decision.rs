use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bgp_wire::PathAttrs;

use crate::bgp::route::{
    AddressFamily, InternalMessage, PeerId, PeerInfo, PeerKind, RouteArena, RouteFlags, RouteId,
};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp};

#[derive(Debug)]
struct Candidate {
    peer: PeerId,
    id: RouteId,
    genid: u32,
}

/// Best-path selection. Collects per-peer alternatives for each prefix
/// and emits downstream only the tie-break winner; candidates with an
/// unresolvable next hop are disqualified.
#[derive(Debug)]
pub struct DecisionTable<A: AddressFamily> {
    id: TableId,
    /// Upstream nhlookup tables, one per peering.
    parents: HashMap<TableId, PeerId>,
    next: TableId,
    candidates: HashMap<A::Net, Vec<Candidate>>,
    winner: HashMap<A::Net, PeerId>,
}

impl<A: AddressFamily> DecisionTable<A> {
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            parents: HashMap::new(),
            next: 0,
            candidates: HashMap::new(),
            winner: HashMap::new(),
        }
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn add_parent(&mut self, parent: TableId, peer: PeerId) {
        self.parents.insert(parent, peer);
    }

    pub fn remove_parent(&mut self, parent: TableId) {
        self.parents.remove(&parent);
    }

    /// The current winner for a prefix (for show commands and tests).
    pub fn winner(&self, arena: &RouteArena<A>, net: &A::Net) -> Option<(PeerId, Arc<PathAttrs>)> {
        let peer = *self.winner.get(net)?;
        let cand = self
            .candidates
            .get(net)?
            .iter()
            .find(|c| c.peer == peer)?;
        Some((peer, arena.get(cand.id).attrs.clone()))
    }

    fn local_pref(ctx: &Ctx<A>, info: &PeerInfo, attrs: &PathAttrs) -> u32 {
        // LOCAL_PREF is only meaningful from internal peers; external
        // routes run on the configured default.
        if info.kind.is_ebgp() {
            ctx.config.default_local_pref
        } else {
            attrs
                .local_pref
                .map(|lp| lp.local_pref)
                .unwrap_or(ctx.config.default_local_pref)
        }
    }

    fn tiebreak_router_id(info: &PeerInfo, attrs: &PathAttrs) -> Ipv4Addr {
        // Originator-id substitution for reflected routes.
        attrs
            .originator_id
            .map(|oid| oid.id)
            .unwrap_or(info.router_id)
    }

    fn peer_kind_rank(kind: PeerKind) -> u8 {
        match kind {
            PeerKind::Ebgp => 0,
            PeerKind::Confed => 1,
            PeerKind::Ibgp => 2,
        }
    }

    /// The classical tie-break ladder; `a` beats `b` on Ordering::Less.
    fn compare(ctx: &Ctx<A>, a: &Candidate, b: &Candidate) -> Ordering {
        let route_a = ctx.arena.get(a.id);
        let route_b = ctx.arena.get(b.id);
        let info_a = ctx.peers.get(&a.peer);
        let info_b = ctx.peers.get(&b.peer);
        let (Some(info_a), Some(info_b)) = (info_a, info_b) else {
            return Ordering::Equal;
        };
        let attrs_a = &route_a.attrs;
        let attrs_b = &route_b.attrs;

        // 1. Highest LOCAL_PREF.
        let lp_a = Self::local_pref(ctx, info_a, attrs_a);
        let lp_b = Self::local_pref(ctx, info_b, attrs_b);
        if lp_a != lp_b {
            return lp_b.cmp(&lp_a);
        }

        // 2. Shortest AS path (confederation segments count nothing).
        let len_a = attrs_a.aspath_len();
        let len_b = attrs_b.aspath_len();
        if len_a != len_b {
            return len_a.cmp(&len_b);
        }

        // 3. Lowest ORIGIN.
        let origin_a = attrs_a.origin_or_incomplete();
        let origin_b = attrs_b.origin_or_incomplete();
        if origin_a != origin_b {
            return origin_a.cmp(&origin_b);
        }

        // 4. Lowest MED, only between routes from the same neighbor AS
        //    unless always-compare-med.
        let same_as = attrs_a.neighboring_as() == attrs_b.neighboring_as()
            && attrs_a.neighboring_as().is_some();
        if same_as || ctx.config.always_compare_med {
            let med_a = attrs_a.med.map(|m| m.med).unwrap_or(0);
            let med_b = attrs_b.med.map(|m| m.med).unwrap_or(0);
            if med_a != med_b {
                return med_a.cmp(&med_b);
            }
        }

        // 5. EBGP over IBGP.
        let rank_a = Self::peer_kind_rank(info_a.kind);
        let rank_b = Self::peer_kind_rank(info_b.kind);
        if rank_a != rank_b {
            return rank_a.cmp(&rank_b);
        }

        // 6. Lowest IGP metric to the next hop.
        let metric_a = route_a.igp_metric.unwrap_or(u32::MAX);
        let metric_b = route_b.igp_metric.unwrap_or(u32::MAX);
        if metric_a != metric_b {
            return metric_a.cmp(&metric_b);
        }

        // 7. Lowest router id, originator substituted for reflected.
        let rid_a = Self::tiebreak_router_id(info_a, attrs_a);
        let rid_b = Self::tiebreak_router_id(info_b, attrs_b);
        if rid_a != rid_b {
            return rid_a.cmp(&rid_b);
        }

        // 8. Shortest cluster list.
        let cl_a = attrs_a.cluster_list.as_ref().map(|c| c.len()).unwrap_or(0);
        let cl_b = attrs_b.cluster_list.as_ref().map(|c| c.len()).unwrap_or(0);
        if cl_a != cl_b {
            return cl_a.cmp(&cl_b);
        }

        // 9. Lowest peer address.
        info_a.addr.cmp(&info_b.addr)
    }

    fn select(&self, ctx: &Ctx<A>, net: &A::Net) -> Option<PeerId> {
        let candidates = self.candidates.get(net)?;
        let mut best: Option<&Candidate> = None;
        for candidate in candidates.iter() {
            let route = ctx.arena.get(candidate.id);
            if !route.flags.contains(RouteFlags::NEXTHOP_RESOLVED) {
                continue;
            }
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    if Self::compare(ctx, candidate, current) == Ordering::Less {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best.map(|c| c.peer)
    }

    fn candidate_msg(&self, net: A::Net, peer: PeerId) -> Option<InternalMessage<A>> {
        let cand = self
            .candidates
            .get(&net)?
            .iter()
            .find(|c| c.peer == peer)?;
        Some(InternalMessage::new(cand.id, net, cand.peer, cand.genid))
    }

    /// Recompute the winner for `net` and emit the downstream delta. The
    /// previous winner's message must still be constructible, so callers
    /// defer arena frees to the end of the run.
    fn rerun(
        &mut self,
        ctx: &mut Ctx<A>,
        net: A::Net,
        prev_msg: Option<InternalMessage<A>>,
    ) -> Vec<TableOp<A>> {
        let new_peer = self.select(ctx, &net);
        let prev_peer = self.winner.get(&net).copied();

        match (prev_msg, new_peer) {
            (None, Some(peer)) => {
                self.winner.insert(net, peer);
                let msg = self.candidate_msg(net, peer).expect("winner candidate");
                ctx.arena.get_mut(msg.id).flags.insert(RouteFlags::WINNER);
                ctx.out.delivered = true;
                vec![TableOp::Add {
                    to: self.next,
                    caller: self.id,
                    msg,
                }]
            }
            (Some(old_msg), Some(peer)) => {
                let msg = self.candidate_msg(net, peer).expect("winner candidate");
                if prev_peer == Some(peer) && msg.id == old_msg.id {
                    // Same candidate still wins, untouched.
                    return Vec::new();
                }
                self.winner.insert(net, peer);
                ctx.arena.get_mut(msg.id).flags.insert(RouteFlags::WINNER);
                ctx.out.delivered = true;
                vec![TableOp::Replace {
                    to: self.next,
                    caller: self.id,
                    old: old_msg,
                    new: msg,
                }]
            }
            (Some(old_msg), None) => {
                self.winner.remove(&net);
                vec![TableOp::Delete {
                    to: self.next,
                    caller: self.id,
                    msg: old_msg,
                }]
            }
            (None, None) => Vec::new(),
        }
    }

    /// Snapshot the current winner as a message before candidates change.
    fn prev_winner_msg(&self, net: &A::Net) -> Option<InternalMessage<A>> {
        let peer = *self.winner.get(net)?;
        self.candidate_msg(*net, peer)
    }

    fn upsert_candidate(&mut self, ctx: &mut Ctx<A>, msg: &InternalMessage<A>) -> bool {
        let clone = ctx.arena.clone_entry(msg.id);
        let list = self.candidates.entry(msg.net).or_default();
        if let Some(existing) = list.iter_mut().find(|c| c.peer == msg.origin) {
            if existing.genid > msg.genid {
                // Stale epoch; the candidate from the newer peering wins.
                ctx.arena.free(clone);
                return false;
            }
            ctx.out.free_after.push(existing.id);
            existing.id = clone;
            existing.genid = msg.genid;
        } else {
            list.push(Candidate {
                peer: msg.origin,
                id: clone,
                genid: msg.genid,
            });
        }
        true
    }

    fn remove_candidate(&mut self, ctx: &mut Ctx<A>, net: &A::Net, peer: PeerId, genid: u32) -> bool {
        let Some(list) = self.candidates.get_mut(net) else {
            return false;
        };
        let Some(pos) = list.iter().position(|c| c.peer == peer) else {
            return false;
        };
        if list[pos].genid > genid {
            return false;
        }
        let cand = list.remove(pos);
        ctx.out.free_after.push(cand.id);
        if list.is_empty() {
            self.candidates.remove(net);
        }
        true
    }

    /// An IGP distance (or resolvability) changed under a next hop:
    /// refresh the affected candidates and re-run decision for their
    /// prefixes.
    pub fn igp_nexthop_changed(
        &mut self,
        ctx: &mut Ctx<A>,
        nexthop: A::Addr,
        resolvable: bool,
        metric: u32,
    ) -> Result<Vec<TableOp<A>>> {
        let mut affected: Vec<A::Net> = Vec::new();
        for (net, list) in self.candidates.iter() {
            for cand in list.iter() {
                if ctx.arena.get(cand.id).nexthop() == Some(nexthop) {
                    affected.push(*net);
                    break;
                }
            }
        }
        let mut ops = Vec::new();
        for net in affected {
            let prev = self.prev_winner_msg(&net);
            if let Some(list) = self.candidates.get(&net) {
                let ids: Vec<RouteId> = list
                    .iter()
                    .filter(|c| ctx.arena.get(c.id).nexthop() == Some(nexthop))
                    .map(|c| c.id)
                    .collect();
                for id in ids {
                    let route = ctx.arena.get_mut(id);
                    route.flags.set(RouteFlags::NEXTHOP_RESOLVED, resolvable);
                    route.igp_metric = resolvable.then_some(metric);
                }
            }
            ops.extend(self.rerun(ctx, net, prev));
        }
        Ok(ops)
    }

    pub fn release(self, arena: &mut RouteArena<A>) {
        for list in self.candidates.into_values() {
            for cand in list {
                arena.free(cand.id);
            }
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for DecisionTable<A> {
    fn name(&self) -> String {
        "decision".to_string()
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if !self.parents.contains_key(&caller) {
            return Err(CoreError::fatal(format!(
                "decision: caller {} is not a registered parent",
                caller
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
        let prev = self.prev_winner_msg(&msg.net);
        if !self.upsert_candidate(ctx, &msg) {
            return Ok(Vec::new());
        }
        Ok(self.rerun(ctx, msg.net, prev))
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        _old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        // The candidate store replaces per (net, peer); the old half's
        // identity is implicit.
        self.add_route(ctx, caller, new)
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        let prev = self.prev_winner_msg(&msg.net);
        if !self.remove_candidate(ctx, &msg.net, msg.origin, msg.genid) {
            return Ok(Vec::new());
        }
        Ok(self.rerun(ctx, msg.net, prev))
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
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        // Only winners travel to the new peer.
        if self.winner.get(&msg.net) != Some(&msg.origin) {
            return Ok(Vec::new());
        }
        Ok(vec![TableOp::Dump {
            to: self.next,
            caller: self.id,
            msg,
            dump_peer,
        }])
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, net: &A::Net) -> Option<(RouteId, u32)> {
        let peer = *self.winner.get(net)?;
        self.candidates
            .get(net)?
            .iter()
            .find(|c| c.peer == peer)
            .map(|c| (c.id, c.genid))
    }
}
