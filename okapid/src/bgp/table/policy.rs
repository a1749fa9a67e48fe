use std::sync::Arc;

use bgp_wire::{Community, LocalPref, Med, PathAttrs};

use crate::bgp::route::{
    AddressFamily, InternalMessage, PeerId, PeerInfo, RouteArena, RouteFlags, RouteId,
    POLICY_EXPORT, POLICY_IMPORT, POLICY_SOURCE_MATCH,
};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp};

/// Which of the three inline filter stages this table is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Import,
    SourceMatch,
    Export,
}

impl PolicyKind {
    fn slot(&self) -> usize {
        match self {
            PolicyKind::Import => POLICY_IMPORT,
            PolicyKind::SourceMatch => POLICY_SOURCE_MATCH,
            PolicyKind::Export => POLICY_EXPORT,
        }
    }
}

/// The variables a policy term may read, bound to the route under
/// evaluation. The export flavor additionally exposes the outbound
/// neighbor; the other flavors leave it unbound.
pub struct VarRw<'a, A: AddressFamily> {
    pub net: A::Net,
    pub attrs: &'a PathAttrs,
    pub source: Option<&'a PeerInfo>,
    pub neighbor: Option<&'a PeerInfo>,
}

#[derive(Debug, Clone)]
pub enum PolicyMatch<A: AddressFamily> {
    /// Prefix equals, or is contained in when `or_longer`.
    Prefix { net: A::Net, or_longer: bool },
    AsPathContains(u32),
    AsPathLenAtMost(u32),
    CommunityContains(u32),
    SourceAs(u32),
    /// Export flavor only; never matches when the neighbor is unbound.
    NeighborAs(u32),
}

impl<A: AddressFamily> PolicyMatch<A> {
    fn matches(&self, varrw: &VarRw<A>) -> bool {
        match self {
            PolicyMatch::Prefix { net, or_longer } => {
                if *or_longer {
                    A::net_contains(net, &varrw.net)
                } else {
                    *net == varrw.net
                }
            }
            PolicyMatch::AsPathContains(asn) => varrw
                .attrs
                .aspath
                .as_ref()
                .is_some_and(|p| p.contains(*asn)),
            PolicyMatch::AsPathLenAtMost(len) => varrw.attrs.aspath_len() <= *len,
            PolicyMatch::CommunityContains(com) => varrw
                .attrs
                .community
                .as_ref()
                .is_some_and(|c| c.contains(com)),
            PolicyMatch::SourceAs(asn) => {
                varrw.source.is_some_and(|peer| peer.neighbor_as == *asn)
            }
            PolicyMatch::NeighborAs(asn) => {
                varrw.neighbor.is_some_and(|peer| peer.neighbor_as == *asn)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PolicyMod {
    SetLocalPref(u32),
    SetMed(u32),
    AddCommunity(u32),
    PrependAs(u32),
}

impl PolicyMod {
    fn apply(&self, attrs: &mut PathAttrs) {
        match self {
            PolicyMod::SetLocalPref(v) => attrs.local_pref = Some(LocalPref::new(*v)),
            PolicyMod::SetMed(v) => attrs.med = Some(Med::new(*v)),
            PolicyMod::AddCommunity(v) => {
                let com = attrs.community.get_or_insert_with(Community::new);
                com.push(*v);
                com.sort_uniq();
            }
            PolicyMod::PrependAs(asn) => {
                if let Some(aspath) = attrs.aspath.as_mut() {
                    aspath.prepend(*asn);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PolicyAction {
    Accept,
    Reject,
    Modify(Vec<PolicyMod>),
}

#[derive(Debug, Clone)]
pub struct PolicyRule<A: AddressFamily> {
    pub matches: Vec<PolicyMatch<A>>,
    pub action: PolicyAction,
}

/// First-match-wins term list; no match means accept unchanged.
#[derive(Debug, Clone)]
pub struct PolicyProgram<A: AddressFamily> {
    pub rules: Vec<PolicyRule<A>>,
}

/// What the evaluator decided for one route.
#[derive(Debug)]
pub enum Disposition {
    Accept,
    Reject,
    Modify(PathAttrs),
}

impl<A: AddressFamily> PolicyProgram<A> {
    pub fn accept_all() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn reject_all() -> Self {
        Self {
            rules: vec![PolicyRule {
                matches: Vec::new(),
                action: PolicyAction::Reject,
            }],
        }
    }

    pub fn evaluate(&self, varrw: &VarRw<A>) -> Disposition {
        for rule in self.rules.iter() {
            if !rule.matches.iter().all(|m| m.matches(varrw)) {
                continue;
            }
            return match &rule.action {
                PolicyAction::Accept => Disposition::Accept,
                PolicyAction::Reject => Disposition::Reject,
                PolicyAction::Modify(mods) => {
                    // Clone before mutating so RIB-In never sees the edit.
                    let mut attrs = varrw.attrs.clone();
                    for m in mods.iter() {
                        m.apply(&mut attrs);
                    }
                    Disposition::Modify(attrs)
                }
            };
        }
        Disposition::Accept
    }
}

/// Inline policy filter stage. Import, source-match and export flavors
/// share this table; they differ only in which VarRW bindings exist.
#[derive(Debug)]
pub struct PolicyTable<A: AddressFamily> {
    id: TableId,
    kind: PolicyKind,
    program: Arc<PolicyProgram<A>>,
    parent: TableId,
    next: TableId,
    neighbor: Option<PeerId>,
}

impl<A: AddressFamily> PolicyTable<A> {
    pub fn new(id: TableId, kind: PolicyKind, program: Arc<PolicyProgram<A>>) -> Self {
        Self {
            id,
            kind,
            program,
            parent: 0,
            next: 0,
            neighbor: None,
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn set_neighbor(&mut self, peer: PeerId) {
        self.neighbor = Some(peer);
    }

    pub fn set_program(&mut self, program: Arc<PolicyProgram<A>>) {
        self.program = program;
    }

    /// Evaluate the route behind `msg`. On modification the result is a
    /// fresh arena entry (copy-on-write); the source entry's filter slot
    /// and FILTERED flag record the outcome for later re-filter passes.
    fn filter(&self, ctx: &mut Ctx<A>, msg: &InternalMessage<A>) -> Option<InternalMessage<A>> {
        let route = ctx.arena.get(msg.id);
        let varrw = VarRw::<A> {
            net: route.net,
            attrs: &route.attrs,
            source: ctx.peers.get(&msg.origin),
            neighbor: self.neighbor.and_then(|peer| ctx.peers.get(&peer)),
        };
        let disposition = self.program.evaluate(&varrw);
        let slot = self.kind.slot();
        match disposition {
            Disposition::Accept => {
                let route = ctx.arena.get_mut(msg.id);
                route.flags.remove(RouteFlags::FILTERED);
                route.policy_attrs[slot] = None;
                Some(msg.clone())
            }
            Disposition::Reject => {
                let route = ctx.arena.get_mut(msg.id);
                route.flags.insert(RouteFlags::FILTERED);
                route.policy_attrs[slot] = None;
                ctx.out.filtered = true;
                None
            }
            Disposition::Modify(attrs) => {
                let attrs = Arc::new(attrs);
                let route = ctx.arena.get_mut(msg.id);
                route.flags.remove(RouteFlags::FILTERED);
                route.policy_attrs[slot] = Some(attrs.clone());
                let copy = ctx.arena.clone_entry(msg.id);
                ctx.arena.get_mut(copy).attrs = attrs;
                ctx.out.free_after.push(copy);
                let mut out = msg.clone();
                out.id = copy;
                out.changed = true;
                out.copied = true;
                Some(out)
            }
        }
    }

    /// Disposition this stage recorded for the route the last time it
    /// passed through, used when a re-filter replays a route against a
    /// changed program: the old half must reflect what downstream saw.
    fn cached(&self, ctx: &mut Ctx<A>, msg: &InternalMessage<A>) -> Option<InternalMessage<A>> {
        let route = ctx.arena.get(msg.id);
        if route.flags.contains(RouteFlags::FILTERED) {
            return None;
        }
        match &route.policy_attrs[self.kind.slot()] {
            Some(attrs) => {
                let attrs = attrs.clone();
                let copy = ctx.arena.clone_entry(msg.id);
                ctx.arena.get_mut(copy).attrs = attrs;
                ctx.out.free_after.push(copy);
                let mut out = msg.clone();
                out.id = copy;
                out.copied = true;
                Some(out)
            }
            None => Some(msg.clone()),
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for PolicyTable<A> {
    fn name(&self) -> String {
        format!("policy({:?})", self.kind)
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
        match self.filter(ctx, &msg) {
            Some(out) => Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg: out,
            }]),
            None => Ok(Vec::new()),
        }
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        // A re-filter replays the same stored route against a changed
        // program; the old half must then come from the recorded
        // disposition, not a fresh evaluation.
        let old_out = if old.id == new.id {
            self.cached(ctx, &old)
        } else {
            self.filter(ctx, &old)
        };
        let new_out = self.filter(ctx, &new);
        let ops = match (old_out, new_out) {
            (Some(old_out), Some(new_out)) => vec![TableOp::Replace {
                to: self.next,
                caller: self.id,
                old: old_out,
                new: new_out,
            }],
            (Some(old_out), None) => vec![TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg: old_out,
            }],
            (None, Some(new_out)) => vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg: new_out,
            }],
            (None, None) => Vec::new(),
        };
        Ok(ops)
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        // A route the filter rejected never went downstream, so its
        // deletion must not either. The recorded disposition decides,
        // so deletes stay consistent across program changes.
        match self.cached(ctx, &msg) {
            Some(out) => Ok(vec![TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg: out,
            }]),
            None => Ok(Vec::new()),
        }
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
        match self.filter(ctx, &msg) {
            Some(out) => Ok(vec![TableOp::Dump {
                to: self.next,
                caller: self.id,
                msg: out,
                dump_peer,
            }]),
            None => Ok(Vec::new()),
        }
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, _net: &A::Net) -> Option<(RouteId, u32)> {
        None
    }
}
