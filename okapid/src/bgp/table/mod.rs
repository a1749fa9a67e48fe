pub mod ribin;
pub use ribin::RibInTable;

pub mod policy;
pub use policy::{PolicyKind, PolicyProgram, PolicyRule, PolicyTable};

pub mod damping;
pub use damping::{Damping, DampingConfig, DampingTable};

pub mod nhlookup;
pub use nhlookup::NhLookupTable;

pub mod decision;
pub use decision::DecisionTable;

pub mod aggregation;
pub use aggregation::AggregationTable;

pub mod fanout;
pub use fanout::FanoutTable;

pub mod cache;
pub use cache::CacheTable;

pub mod ribout;
pub use ribout::RibOutTable;

pub mod dump;
pub use dump::{DumpIterator, PeerDumpStatus};

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;

use bgp_wire::PathAttrs;

use crate::bgp::route::{
    AddressFamily, InternalMessage, PeerId, PeerInfo, RouteArena, RouteId,
};
use crate::error::{CoreError, Result};
use crate::rib::NextHopResolver;

/// Handle into the pipeline's table registry.
pub type TableId = usize;

/// Sentinel caller for operations entering at a chain head.
pub const ENTRY: TableId = usize::MAX;

/// The local speaker as a route origin (aggregates, originated routes).
pub const LOCAL_PEER: PeerId = PeerId(u32::MAX);

/// Disposition reported back to the caller of an add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Used,
    Filtered,
    Unused,
}

/// One unit of work flowing between tables. Tables return the follow-on
/// operations addressed at their downstream table; the pipeline driver
/// owns the queue. Upward notifications do not use these: they are
/// dispatched through the registry by the pipeline itself.
#[derive(Debug)]
pub enum TableOp<A: AddressFamily> {
    Add {
        to: TableId,
        caller: TableId,
        msg: InternalMessage<A>,
    },
    Replace {
        to: TableId,
        caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    },
    Delete {
        to: TableId,
        caller: TableId,
        msg: InternalMessage<A>,
    },
    Push {
        to: TableId,
        caller: TableId,
    },
    Dump {
        to: TableId,
        caller: TableId,
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    },
}

/// Egress product of the pipeline, drained by the peer handler.
#[derive(Debug)]
pub enum Outbound<A: AddressFamily> {
    Update {
        peer: PeerId,
        net: A::Net,
        attrs: Arc<PathAttrs>,
    },
    Withdraw {
        peer: PeerId,
        net: A::Net,
    },
    Push {
        peer: PeerId,
    },
}

/// Side-channel outputs of one driver run.
#[derive(Debug)]
pub struct PipelineOut<A: AddressFamily> {
    pub outbound: Vec<Outbound<A>>,
    pub free_after: Vec<RouteId>,
    pub filtered: bool,
    pub delivered: bool,
}

impl<A: AddressFamily> Default for PipelineOut<A> {
    fn default() -> Self {
        Self {
            outbound: Vec::new(),
            free_after: Vec::new(),
            filtered: false,
            delivered: false,
        }
    }
}

/// Everything a table may touch besides its own state.
pub struct Ctx<'a, A: AddressFamily> {
    pub arena: &'a mut RouteArena<A>,
    pub resolver: &'a mut NextHopResolver<A>,
    pub peers: &'a BTreeMap<PeerId, PeerInfo>,
    pub config: &'a PipelineConfig,
    pub out: &'a mut PipelineOut<A>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub local_as: u32,
    pub router_id: Ipv4Addr,
    pub cluster_id: Ipv4Addr,
    pub default_local_pref: u32,
    pub always_compare_med: bool,
    pub confederation_id: Option<u32>,
    pub damping: DampingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            local_as: 0,
            router_id: Ipv4Addr::UNSPECIFIED,
            cluster_id: Ipv4Addr::UNSPECIFIED,
            default_local_pref: 100,
            always_compare_med: false,
            confederation_id: None,
            damping: DampingConfig::default(),
        }
    }
}

/// The route-table contract shared by every stage.
pub trait RouteTable<A: AddressFamily> {
    fn name(&self) -> String;

    /// Downward calls must come from the configured parent; a violator
    /// is a programming error and fatal.
    fn check_caller(&self, caller: TableId) -> Result<()>;

    fn add_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>>;

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>>;

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>>;

    fn push(&mut self, ctx: &mut Ctx<A>, caller: TableId) -> Result<Vec<TableOp<A>>>;

    fn route_dump(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>>;

    /// Lookup by prefix: stored route plus the genid it was stored under.
    fn lookup_route(&self, arena: &RouteArena<A>, net: &A::Net) -> Option<(RouteId, u32)>;
}

/// Tagged stage variant; per-kind state lives in the payload.
#[derive(Debug)]
pub enum TableKind<A: AddressFamily> {
    RibIn(RibInTable<A>),
    Policy(PolicyTable<A>),
    Damping(DampingTable<A>),
    NhLookup(NhLookupTable<A>),
    Decision(DecisionTable<A>),
    Aggregation(AggregationTable<A>),
    Fanout(FanoutTable<A>),
    Cache(CacheTable<A>),
    RibOut(RibOutTable<A>),
}

macro_rules! for_each_kind {
    ($self:expr, $table:ident => $body:expr) => {
        match $self {
            TableKind::RibIn($table) => $body,
            TableKind::Policy($table) => $body,
            TableKind::Damping($table) => $body,
            TableKind::NhLookup($table) => $body,
            TableKind::Decision($table) => $body,
            TableKind::Aggregation($table) => $body,
            TableKind::Fanout($table) => $body,
            TableKind::Cache($table) => $body,
            TableKind::RibOut($table) => $body,
        }
    };
}

impl<A: AddressFamily> RouteTable<A> for TableKind<A> {
    fn name(&self) -> String {
        for_each_kind!(self, table => table.name())
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        for_each_kind!(self, table => table.check_caller(caller))
    }

    fn add_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        for_each_kind!(self, table => table.add_route(ctx, caller, msg))
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        for_each_kind!(self, table => table.replace_route(ctx, caller, old, new))
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        for_each_kind!(self, table => table.delete_route(ctx, caller, msg))
    }

    fn push(&mut self, ctx: &mut Ctx<A>, caller: TableId) -> Result<Vec<TableOp<A>>> {
        for_each_kind!(self, table => table.push(ctx, caller))
    }

    fn route_dump(
        &mut self,
        ctx: &mut Ctx<A>,
        caller: TableId,
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        for_each_kind!(self, table => table.route_dump(ctx, caller, msg, dump_peer))
    }

    fn lookup_route(&self, arena: &RouteArena<A>, net: &A::Net) -> Option<(RouteId, u32)> {
        for_each_kind!(self, table => table.lookup_route(arena, net))
    }
}

#[derive(Debug, Clone, Copy)]
struct IngressChain {
    ribin: TableId,
    import: TableId,
    damping: TableId,
    nhlookup: TableId,
}

#[derive(Debug, Clone, Copy)]
struct EgressChain {
    cache: TableId,
    export: TableId,
    ribout: TableId,
}

/// One address family's table plumbing: per-peer ingress chains feeding a
/// shared decision / source-match / aggregation / fanout middle, fanning
/// out into per-peer egress chains. The chain is an owned linear list per
/// direction; tables address each other through this registry.
pub struct Pipeline<A: AddressFamily> {
    tables: Vec<Option<TableKind<A>>>,
    pub arena: RouteArena<A>,
    pub resolver: NextHopResolver<A>,
    pub peers: BTreeMap<PeerId, PeerInfo>,
    pub config: PipelineConfig,
    out: PipelineOut<A>,
    decision: TableId,
    sourcematch: TableId,
    aggregation: TableId,
    fanout: TableId,
    ingress: BTreeMap<PeerId, IngressChain>,
    egress: BTreeMap<PeerId, EgressChain>,
    dumps: BTreeMap<PeerId, DumpIterator<A>>,
}

impl<A: AddressFamily> Pipeline<A> {
    pub fn new(config: PipelineConfig, resolver: NextHopResolver<A>) -> Self {
        let mut pipeline = Self {
            tables: Vec::new(),
            arena: RouteArena::new(),
            resolver,
            peers: BTreeMap::new(),
            config,
            out: PipelineOut::default(),
            decision: 0,
            sourcematch: 0,
            aggregation: 0,
            fanout: 0,
            ingress: BTreeMap::new(),
            egress: BTreeMap::new(),
            dumps: BTreeMap::new(),
        };

        // Shared middle of the chain, wired head to tail.
        let decision = pipeline.insert(|id| TableKind::Decision(DecisionTable::new(id)));
        let sourcematch = pipeline.insert(|id| {
            TableKind::Policy(PolicyTable::new(
                id,
                PolicyKind::SourceMatch,
                Arc::new(PolicyProgram::accept_all()),
            ))
        });
        let aggregation =
            pipeline.insert(|id| TableKind::Aggregation(AggregationTable::new(id)));
        let fanout = pipeline.insert(|id| TableKind::Fanout(FanoutTable::new(id)));

        pipeline.decision = decision;
        pipeline.sourcematch = sourcematch;
        pipeline.aggregation = aggregation;
        pipeline.fanout = fanout;

        pipeline.with_table(decision, |t| {
            if let TableKind::Decision(d) = t {
                d.set_next(sourcematch);
            }
        });
        pipeline.with_table(sourcematch, |t| {
            if let TableKind::Policy(p) = t {
                p.set_parent(decision);
                p.set_next(aggregation);
            }
        });
        pipeline.with_table(aggregation, |t| {
            if let TableKind::Aggregation(a) = t {
                a.set_parent(sourcematch);
                a.set_next(fanout);
            }
        });
        pipeline.with_table(fanout, |t| {
            if let TableKind::Fanout(f) = t {
                f.set_parent(aggregation);
            }
        });

        pipeline
    }

    fn insert<F: FnOnce(TableId) -> TableKind<A>>(&mut self, build: F) -> TableId {
        let id = self.tables.len();
        self.tables.push(Some(build(id)));
        id
    }

    fn with_table<F: FnOnce(&mut TableKind<A>)>(&mut self, id: TableId, f: F) {
        if let Some(Some(table)) = self.tables.get_mut(id) {
            f(table);
        }
    }

    pub fn fanout_id(&self) -> TableId {
        self.fanout
    }

    /// Plumb a new peering: ingress chain into decision, fanout branch
    /// into a fresh egress chain.
    pub fn add_peering(
        &mut self,
        info: PeerInfo,
        import: Arc<PolicyProgram<A>>,
        export: Arc<PolicyProgram<A>>,
    ) {
        let peer = info.id;
        let decision = self.decision;
        let fanout = self.fanout;

        let ribin = self.insert(|id| TableKind::RibIn(RibInTable::new(id, peer)));
        let import_id =
            self.insert(|id| TableKind::Policy(PolicyTable::new(id, PolicyKind::Import, import)));
        let damping_cfg = self.config.damping.clone();
        let damping =
            self.insert(|id| TableKind::Damping(DampingTable::new(id, damping_cfg)));
        let nhlookup = self.insert(|id| TableKind::NhLookup(NhLookupTable::new(id)));

        self.with_table(ribin, |t| {
            if let TableKind::RibIn(r) = t {
                r.set_next(import_id);
            }
        });
        self.with_table(import_id, |t| {
            if let TableKind::Policy(p) = t {
                p.set_parent(ribin);
                p.set_next(damping);
            }
        });
        self.with_table(damping, |t| {
            if let TableKind::Damping(d) = t {
                d.set_parent(import_id);
                d.set_next(nhlookup);
            }
        });
        self.with_table(nhlookup, |t| {
            if let TableKind::NhLookup(n) = t {
                n.set_parent(damping);
                n.set_next(decision);
            }
        });
        self.with_table(decision, |t| {
            if let TableKind::Decision(d) = t {
                d.add_parent(nhlookup, peer);
            }
        });

        let cache = self.insert(|id| TableKind::Cache(CacheTable::new(id, peer)));
        let export_id =
            self.insert(|id| TableKind::Policy(PolicyTable::new(id, PolicyKind::Export, export)));
        let ribout = self.insert(|id| TableKind::RibOut(RibOutTable::new(id, peer)));

        self.with_table(cache, |t| {
            if let TableKind::Cache(c) = t {
                c.set_parent(fanout);
                c.set_next(export_id);
            }
        });
        self.with_table(export_id, |t| {
            if let TableKind::Policy(p) = t {
                p.set_parent(cache);
                p.set_next(ribout);
                p.set_neighbor(peer);
            }
        });
        self.with_table(ribout, |t| {
            if let TableKind::RibOut(r) = t {
                r.set_parent(export_id);
            }
        });
        self.with_table(fanout, |t| {
            if let TableKind::Fanout(f) = t {
                f.add_branch(peer, cache);
            }
        });

        self.ingress.insert(
            peer,
            IngressChain {
                ribin,
                import: import_id,
                damping,
                nhlookup,
            },
        );
        self.egress.insert(
            peer,
            EgressChain {
                cache,
                export: export_id,
                ribout,
            },
        );
        self.peers.insert(peer, info);
    }

    /// Ingress-only chain for locally originated routes (networks the
    /// control surface asks us to originate, at any time).
    pub fn add_local_origin(&mut self) {
        let decision = self.decision;
        let ribin = self.insert(|id| TableKind::RibIn(RibInTable::new(id, LOCAL_PEER)));
        let import_id = self.insert(|id| {
            TableKind::Policy(PolicyTable::new(
                id,
                PolicyKind::Import,
                Arc::new(PolicyProgram::accept_all()),
            ))
        });
        let damping_cfg = DampingConfig {
            enabled: false,
            ..self.config.damping.clone()
        };
        let damping = self.insert(|id| TableKind::Damping(DampingTable::new(id, damping_cfg)));
        let nhlookup = self.insert(|id| TableKind::NhLookup(NhLookupTable::new(id)));

        self.with_table(ribin, |t| {
            if let TableKind::RibIn(r) = t {
                r.set_next(import_id);
            }
        });
        self.with_table(import_id, |t| {
            if let TableKind::Policy(p) = t {
                p.set_parent(ribin);
                p.set_next(damping);
            }
        });
        self.with_table(damping, |t| {
            if let TableKind::Damping(d) = t {
                d.set_parent(import_id);
                d.set_next(nhlookup);
            }
        });
        self.with_table(nhlookup, |t| {
            if let TableKind::NhLookup(n) = t {
                n.set_parent(damping);
                n.set_next(decision);
            }
        });
        self.with_table(decision, |t| {
            if let TableKind::Decision(d) = t {
                d.add_parent(nhlookup, LOCAL_PEER);
            }
        });

        self.ingress.insert(
            LOCAL_PEER,
            IngressChain {
                ribin,
                import: import_id,
                damping,
                nhlookup,
            },
        );
        self.peers.insert(
            LOCAL_PEER,
            PeerInfo {
                id: LOCAL_PEER,
                addr: std::net::IpAddr::V4(self.config.router_id),
                kind: crate::bgp::route::PeerKind::Ibgp,
                neighbor_as: self.config.local_as,
                router_id: self.config.router_id,
                reflector_client: false,
            },
        );
    }

    /// Tear the peering's tables out of the registry. The peering must be
    /// down (its routes swept) first.
    pub fn delete_peering(&mut self, peer: PeerId) {
        if let Some(ingress) = self.ingress.remove(&peer) {
            self.with_table(self.decision, |t| {
                if let TableKind::Decision(d) = t {
                    d.remove_parent(ingress.nhlookup);
                }
            });
            for id in [
                ingress.ribin,
                ingress.import,
                ingress.damping,
                ingress.nhlookup,
            ] {
                self.drop_table(id);
            }
        }
        if let Some(egress) = self.egress.remove(&peer) {
            if let Ok((table, ctx)) = self.split(self.fanout) {
                if let TableKind::Fanout(f) = table {
                    f.remove_branch(peer, ctx.arena);
                }
            }
            for id in [egress.cache, egress.export, egress.ribout] {
                self.drop_table(id);
            }
        }
        self.peers.remove(&peer);
        self.dumps.remove(&peer);
    }

    fn drop_table(&mut self, id: TableId) {
        let Some(slot) = self.tables.get_mut(id) else {
            return;
        };
        let Some(table) = slot.take() else {
            return;
        };
        table.release(&mut self.arena, &mut self.resolver);
    }

    fn reset_out(&mut self) {
        self.out.filtered = false;
        self.out.delivered = false;
    }

    fn outcome(&self) -> RouteOutcome {
        if self.out.delivered {
            RouteOutcome::Used
        } else if self.out.filtered {
            RouteOutcome::Filtered
        } else {
            RouteOutcome::Unused
        }
    }

    /// Drain egress products accumulated by prior calls.
    pub fn take_outbound(&mut self) -> Vec<Outbound<A>> {
        std::mem::take(&mut self.out.outbound)
    }

    /// Ingress: a route learned from `peer`.
    pub fn add_route(
        &mut self,
        peer: PeerId,
        net: A::Net,
        attrs: Arc<PathAttrs>,
    ) -> Result<RouteOutcome> {
        let Some(chain) = self.ingress.get(&peer).copied() else {
            return Err(CoreError::config(format!("no such peering: {}", peer)));
        };
        self.reset_out();
        let op = {
            let (table, mut ctx) = self.split(chain.ribin)?;
            let TableKind::RibIn(ribin) = table else {
                return Err(CoreError::fatal("chain head is not a rib-in"));
            };
            ribin.ingress_add(&mut ctx, net, attrs)?
        };
        self.run(op)?;
        Ok(self.outcome())
    }

    /// Ingress: a withdraw from `peer`.
    pub fn delete_route(&mut self, peer: PeerId, net: A::Net) -> Result<()> {
        let Some(chain) = self.ingress.get(&peer).copied() else {
            return Err(CoreError::config(format!("no such peering: {}", peer)));
        };
        self.reset_out();
        let op = {
            let (table, mut ctx) = self.split(chain.ribin)?;
            let TableKind::RibIn(ribin) = table else {
                return Err(CoreError::fatal("chain head is not a rib-in"));
            };
            ribin.ingress_delete(&mut ctx, net)?
        };
        self.run(op)?;
        Ok(())
    }

    /// Flush per-branch queues after a batch of ingress work.
    pub fn push(&mut self, peer: PeerId) -> Result<()> {
        let Some(chain) = self.ingress.get(&peer).copied() else {
            return Ok(());
        };
        self.run(vec![TableOp::Push {
            to: chain.ribin,
            caller: ENTRY,
        }])
    }

    /// The peering's session dropped: sweep every route it contributed.
    pub fn peering_went_down(&mut self, peer: PeerId) -> Result<()> {
        let Some(chain) = self.ingress.get(&peer).copied() else {
            return Ok(());
        };
        for (_, dump) in self.dumps.iter_mut() {
            dump.peer_went_down(peer);
        }
        self.reset_out();
        let ops = {
            let (table, mut ctx) = self.split(chain.ribin)?;
            let TableKind::RibIn(ribin) = table else {
                return Err(CoreError::fatal("chain head is not a rib-in"));
            };
            ribin.peering_went_down(&mut ctx)?
        };
        self.run(ops)
    }

    /// A fresh session on the peering: bump the epoch and start a
    /// background dump of every other peer's RIB-In toward it.
    pub fn peering_came_up(&mut self, peer: PeerId) -> Result<()> {
        let Some(chain) = self.ingress.get(&peer).copied() else {
            return Ok(());
        };
        self.with_table(chain.ribin, |t| {
            if let TableKind::RibIn(r) = t {
                r.bump_genid();
            }
        });
        let mut dump = DumpIterator::new(peer);
        for (&other, other_chain) in self.ingress.iter() {
            if other == peer {
                continue;
            }
            let Some(TableKind::RibIn(ribin)) = self.tables[other_chain.ribin].as_ref() else {
                continue;
            };
            dump.add_peer(other, ribin.genid(), ribin.net_list());
        }
        self.dumps.insert(peer, dump);
        Ok(())
    }

    /// Advance the dump toward `peer` by up to `batch` routes. Returns
    /// true when the dump is complete (and forgotten).
    pub fn dump_step(&mut self, peer: PeerId, batch: usize) -> Result<bool> {
        let Some(mut dump) = self.dumps.remove(&peer) else {
            return Ok(true);
        };
        for _ in 0..batch {
            let Some(source) = dump.current_peer() else {
                break;
            };
            let Some(chain) = self.ingress.get(&source).copied() else {
                dump.peer_done(source);
                continue;
            };
            let Some(net) = dump.next_net(source) else {
                dump.peer_done(source);
                continue;
            };
            // The snapshot only names prefixes; dump whatever the RIB-In
            // holds for them now, skipping entries from a newer peering.
            let stored = match self.tables[chain.ribin].as_ref() {
                Some(table) => table.lookup_route(&self.arena, &net),
                None => None,
            };
            let Some((id, genid)) = stored else {
                continue;
            };
            if !dump.genid_matches(source, genid) {
                continue;
            }
            let op = {
                let (table, mut ctx) = self.split(chain.ribin)?;
                let TableKind::RibIn(ribin) = table else {
                    return Err(CoreError::fatal("chain head is not a rib-in"));
                };
                ribin.dump_one(&mut ctx, net, id, peer)?
            };
            self.run(op)?;
        }
        let finished = dump.is_complete();
        if finished {
            // Close the dump with a push so the last batch leaves.
            if let Some(egress) = self.egress.get(&peer).copied() {
                self.run(vec![TableOp::Push {
                    to: egress.cache,
                    caller: self.fanout,
                }])?;
            }
        } else {
            self.dumps.insert(peer, dump);
        }
        Ok(finished)
    }

    /// Feed a RIB answer into the resolver cache; when the recorded state
    /// changed, the dependent tables are re-driven.
    pub fn nh_answer(
        &mut self,
        addr: std::net::IpAddr,
        resolvable: bool,
        metric: u32,
    ) -> Result<()> {
        if let Some(addr) = self.resolver.answer(addr, resolvable, metric) {
            self.rib_lookup_done(addr, resolvable, metric)?;
        }
        Ok(())
    }

    /// Resolver callback: a next-hop query completed or its answer moved.
    pub fn rib_lookup_done(&mut self, addr: A::Addr, resolvable: bool, metric: u32) -> Result<()> {
        self.reset_out();
        let chains: Vec<IngressChain> = self.ingress.values().copied().collect();
        for chain in chains {
            let ops = {
                let (table, mut ctx) = self.split(chain.nhlookup)?;
                let TableKind::NhLookup(nhlookup) = table else {
                    continue;
                };
                nhlookup.rib_lookup_done(&mut ctx, addr, resolvable)?
            };
            self.run(ops)?;
        }
        // Decision re-runs prefixes that depend on this next hop.
        let ops = {
            let (table, mut ctx) = self.split(self.decision)?;
            let TableKind::Decision(decision) = table else {
                return Err(CoreError::fatal("decision table missing"));
            };
            decision.igp_nexthop_changed(&mut ctx, addr, resolvable, metric)?
        };
        self.run(ops)
    }

    /// Damping clock tick: release routes whose figure of merit decayed
    /// below the reuse threshold.
    pub fn damping_tick(&mut self) -> Result<()> {
        self.reset_out();
        let chains: Vec<IngressChain> = self.ingress.values().copied().collect();
        for chain in chains {
            let ops = {
                let (table, mut ctx) = self.split(chain.damping)?;
                let TableKind::Damping(damping) = table else {
                    continue;
                };
                damping.tick(&mut ctx)?
            };
            self.run(ops)?;
        }
        Ok(())
    }

    /// Transport backpressure released: drain the branch.
    pub fn output_no_longer_busy(&mut self, peer: PeerId) -> Result<()> {
        let ops = {
            let (table, mut ctx) = self.split(self.fanout)?;
            let TableKind::Fanout(fanout) = table else {
                return Err(CoreError::fatal("fanout table missing"));
            };
            fanout.output_no_longer_busy(&mut ctx, peer)?
        };
        self.run(ops)
    }

    pub fn output_busy(&mut self, peer: PeerId) {
        self.with_table(self.fanout, |t| {
            if let TableKind::Fanout(f) = t {
                f.output_busy(peer);
            }
        });
    }

    /// Session came up: record the local address for next-hop-self.
    pub fn set_local_nexthop(&mut self, peer: PeerId, addr: A::Addr) {
        if let Some(egress) = self.egress.get(&peer).copied() {
            self.with_table(egress.ribout, |t| {
                if let TableKind::RibOut(r) = t {
                    r.set_local_nexthop(addr);
                }
            });
        }
    }

    /// Swap a peering's filter programs. Takes effect for new routes at
    /// once; call `push_routes` to re-filter what is already stored.
    pub fn reconfigure_filters(
        &mut self,
        peer: PeerId,
        import: Option<Arc<PolicyProgram<A>>>,
        export: Option<Arc<PolicyProgram<A>>>,
    ) {
        if let Some(import) = import {
            if let Some(chain) = self.ingress.get(&peer).copied() {
                self.with_table(chain.import, |t| {
                    if let TableKind::Policy(p) = t {
                        p.set_program(import);
                    }
                });
            }
        }
        if let Some(export) = export {
            if let Some(egress) = self.egress.get(&peer).copied() {
                self.with_table(egress.export, |t| {
                    if let TableKind::Policy(p) = t {
                        p.set_program(export);
                    }
                });
            }
        }
    }

    /// Replay every stored route of the peering through its filters, so
    /// changed programs take effect on the existing table contents.
    pub fn push_routes(&mut self, peer: PeerId) -> Result<()> {
        let Some(chain) = self.ingress.get(&peer).copied() else {
            return Ok(());
        };
        let entries: Vec<(A::Net, RouteId, u32)> = {
            let Some(TableKind::RibIn(ribin)) = self.tables[chain.ribin].as_ref() else {
                return Ok(());
            };
            ribin
                .net_list()
                .into_iter()
                .filter_map(|net| {
                    self.tables[chain.ribin]
                        .as_ref()?
                        .lookup_route(&self.arena, &net)
                        .map(|(id, genid)| (net, id, genid))
                })
                .collect()
        };
        self.reset_out();
        for (net, id, genid) in entries {
            let old = InternalMessage::new(id, net, peer, genid);
            let new = InternalMessage::new(id, net, peer, genid);
            self.run(vec![TableOp::Replace {
                to: chain.import,
                caller: chain.ribin,
                old,
                new,
            }])?;
        }
        Ok(())
    }

    /// Configure an aggregate prefix.
    pub fn add_aggregate(&mut self, net: A::Net, summary_only: bool) {
        self.with_table(self.aggregation, |t| {
            if let TableKind::Aggregation(a) = t {
                a.add_aggregate(net, summary_only);
            }
        });
    }

    /// Route count currently held in a peer's RIB-In.
    pub fn ribin_route_count(&self, peer: PeerId) -> usize {
        let Some(chain) = self.ingress.get(&peer) else {
            return 0;
        };
        match self.tables[chain.ribin].as_ref() {
            Some(TableKind::RibIn(r)) => r.route_count(),
            _ => 0,
        }
    }

    pub fn lookup_route(&self, peer: PeerId, net: &A::Net) -> Option<(RouteId, u32)> {
        let chain = self.ingress.get(&peer)?;
        self.tables[chain.ribin]
            .as_ref()?
            .lookup_route(&self.arena, net)
    }

    /// The winner currently advertised downstream for a prefix.
    pub fn best_route(&self, net: &A::Net) -> Option<(PeerId, Arc<PathAttrs>)> {
        match self.tables[self.decision].as_ref() {
            Some(TableKind::Decision(d)) => d.winner(&self.arena, net),
            _ => None,
        }
    }

    /// Split the registry into one table plus a context over the rest.
    fn split(&mut self, id: TableId) -> Result<(&mut TableKind<A>, Ctx<'_, A>)> {
        let Pipeline {
            tables,
            arena,
            resolver,
            peers,
            config,
            out,
            ..
        } = self;
        let table = tables
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| CoreError::fatal(format!("no table with id {}", id)))?;
        Ok((
            table,
            Ctx {
                arena,
                resolver,
                peers,
                config,
                out,
            },
        ))
    }

    /// Depth-first work loop: a table's output is processed before its
    /// siblings, preserving per-route ordering through the chain.
    fn run(&mut self, initial: Vec<TableOp<A>>) -> Result<()> {
        let mut queue: VecDeque<TableOp<A>> = initial.into();
        let mut steps: usize = 0;
        while let Some(op) = queue.pop_front() {
            steps += 1;
            if steps > 1_000_000 {
                return Err(CoreError::fatal("pipeline op loop"));
            }
            let follow = self.dispatch(op)?;
            for op in follow.into_iter().rev() {
                queue.push_front(op);
            }
        }
        // Transient arena entries die once the traversal is over.
        let free = std::mem::take(&mut self.out.free_after);
        for id in free {
            self.arena.free(id);
        }
        Ok(())
    }

    fn dispatch(&mut self, op: TableOp<A>) -> Result<Vec<TableOp<A>>> {
        match op {
            TableOp::Add { to, caller, msg } => {
                let (table, mut ctx) = self.split(to)?;
                table.check_caller(caller)?;
                table.add_route(&mut ctx, caller, msg)
            }
            TableOp::Replace {
                to,
                caller,
                old,
                new,
            } => {
                let (table, mut ctx) = self.split(to)?;
                table.check_caller(caller)?;
                table.replace_route(&mut ctx, caller, old, new)
            }
            TableOp::Delete { to, caller, msg } => {
                let (table, mut ctx) = self.split(to)?;
                table.check_caller(caller)?;
                table.delete_route(&mut ctx, caller, msg)
            }
            TableOp::Push { to, caller } => {
                let (table, mut ctx) = self.split(to)?;
                table.push(&mut ctx, caller)
            }
            TableOp::Dump {
                to,
                caller,
                msg,
                dump_peer,
            } => {
                let (table, mut ctx) = self.split(to)?;
                table.route_dump(&mut ctx, caller, msg, dump_peer)
            }
        }
    }
}

impl<A: AddressFamily> TableKind<A> {
    /// Free any arena entries and resolver registrations the table owns.
    fn release(self, arena: &mut RouteArena<A>, resolver: &mut NextHopResolver<A>) {
        match self {
            TableKind::RibIn(t) => t.release(arena),
            TableKind::Damping(t) => t.release(arena),
            TableKind::NhLookup(t) => t.release(arena, resolver),
            TableKind::Decision(t) => t.release(arena),
            TableKind::Aggregation(t) => t.release(arena),
            TableKind::Fanout(t) => t.release(arena),
            TableKind::Cache(t) => t.release(arena),
            TableKind::Policy(_) | TableKind::RibOut(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::route::{Ipv4Af, PeerKind};
    use bgp_wire::{AsPath, NexthopAttr, Origin};
    use ipnet::Ipv4Net;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer_info(id: u32, addr: [u8; 4], kind: PeerKind, asn: u32) -> PeerInfo {
        PeerInfo {
            id: PeerId(id),
            addr: IpAddr::V4(Ipv4Addr::from(addr)),
            kind,
            neighbor_as: asn,
            router_id: Ipv4Addr::from(addr),
            reflector_client: false,
        }
    }

    fn attrs(asns: &[u32], nexthop: [u8; 4]) -> Arc<PathAttrs> {
        let mut pa = PathAttrs::new();
        pa.origin = Some(Origin::Igp);
        pa.aspath = Some(AsPath::from_sequence(asns.iter().copied()));
        pa.nexthop = Some(NexthopAttr::new(Ipv4Addr::from(nexthop)));
        Arc::new(pa)
    }

    fn pipeline_with_three_peers() -> Pipeline<Ipv4Af> {
        let config = PipelineConfig {
            local_as: 65000,
            router_id: Ipv4Addr::new(10, 0, 0, 100),
            cluster_id: Ipv4Addr::new(10, 0, 0, 100),
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(config, NextHopResolver::new(None));
        let accept = Arc::new(PolicyProgram::accept_all());
        pipeline.add_peering(
            peer_info(1, [10, 0, 0, 1], PeerKind::Ebgp, 65001),
            accept.clone(),
            accept.clone(),
        );
        pipeline.add_peering(
            peer_info(2, [10, 0, 0, 2], PeerKind::Ebgp, 65002),
            accept.clone(),
            accept.clone(),
        );
        pipeline.add_peering(
            peer_info(3, [10, 0, 0, 3], PeerKind::Ibgp, 65000),
            accept.clone(),
            accept,
        );
        pipeline
    }

    fn updates_for(outbound: &[Outbound<Ipv4Af>], peer: PeerId) -> Vec<String> {
        outbound
            .iter()
            .filter_map(|out| match out {
                Outbound::Update { peer: p, net, attrs } if *p == peer => Some(format!(
                    "announce {} via {}",
                    net,
                    attrs
                        .aspath
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_default()
                )),
                Outbound::Withdraw { peer: p, net } if *p == peer => {
                    Some(format!("withdraw {}", net))
                }
                _ => None,
            })
            .collect()
    }

    /// Two external peers advertise the same prefix; the shorter AS path
    /// wins and moves to the third peer. Withdrawing the winner swaps in
    /// the runner-up.
    #[test]
    fn decision_and_fanout() {
        let mut pipeline = pipeline_with_three_peers();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();

        pipeline
            .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
            .unwrap();
        pipeline
            .add_route(PeerId(2), net, attrs(&[65002, 65003], [10, 0, 0, 2]))
            .unwrap();

        // Next hops resolve; the queued routes propagate.
        pipeline
            .nh_answer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), true, 10)
            .unwrap();
        pipeline
            .nh_answer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), true, 10)
            .unwrap();
        pipeline.push(PeerId(1)).unwrap();
        pipeline.push(PeerId(2)).unwrap();

        let (winner, winner_attrs) = pipeline.best_route(&net).expect("winner");
        assert_eq!(winner, PeerId(1));
        assert_eq!(winner_attrs.aspath_len(), 1);

        let outbound = pipeline.take_outbound();
        let to_c = updates_for(&outbound, PeerId(3));
        assert_eq!(to_c.last().unwrap(), "announce 10.0.0.0/24 via 65001");

        // Withdraw from the winner; peer C sees the runner-up.
        pipeline.delete_route(PeerId(1), net).unwrap();
        pipeline.push(PeerId(1)).unwrap();

        let (winner, _) = pipeline.best_route(&net).expect("winner");
        assert_eq!(winner, PeerId(2));
        let outbound = pipeline.take_outbound();
        let to_c = updates_for(&outbound, PeerId(3));
        assert_eq!(to_c.last().unwrap(), "announce 10.0.0.0/24 via 65002 65003");
    }

    /// Backpressure: while a branch is busy its queue grows; releasing
    /// it drains in order.
    #[test]
    fn fanout_branch_backpressure() {
        let mut pipeline = pipeline_with_three_peers();
        let nh = Ipv4Addr::new(10, 0, 0, 1);
        pipeline.output_busy(PeerId(3));

        for i in 0..4u8 {
            let net: Ipv4Net = format!("10.1.{}.0/24", i).parse().unwrap();
            pipeline
                .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
                .unwrap();
        }
        pipeline.nh_answer(IpAddr::V4(nh), true, 10).unwrap();
        pipeline.push(PeerId(1)).unwrap();

        // Nothing escaped toward the busy branch.
        assert!(updates_for(&pipeline.take_outbound(), PeerId(3)).is_empty());

        pipeline.output_no_longer_busy(PeerId(3)).unwrap();
        pipeline.push(PeerId(1)).unwrap();
        let outbound = pipeline.take_outbound();
        let to_c = updates_for(&outbound, PeerId(3));
        assert_eq!(to_c.len(), 4);
        assert!(to_c[0].starts_with("announce 10.1.0.0/24"));
        assert!(to_c[3].starts_with("announce 10.1.3.0/24"));
    }

    /// Peering loss sweeps all contributed routes and the dump iterator
    /// records the source as down.
    #[test]
    fn peering_down_sweeps_routes() {
        let mut pipeline = pipeline_with_three_peers();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        pipeline
            .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
            .unwrap();
        pipeline
            .nh_answer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), true, 10)
            .unwrap();
        pipeline.push(PeerId(1)).unwrap();
        let _ = pipeline.take_outbound();

        pipeline.peering_went_down(PeerId(1)).unwrap();
        pipeline.push(PeerId(1)).unwrap();
        assert!(pipeline.best_route(&net).is_none());
        assert_eq!(pipeline.ribin_route_count(PeerId(1)), 0);
        let outbound = pipeline.take_outbound();
        let to_c = updates_for(&outbound, PeerId(3));
        assert_eq!(to_c.last().unwrap(), "withdraw 10.0.0.0/24");
    }

    /// A new peering receives the current table through the dump path.
    #[test]
    fn dump_to_new_peer() {
        let mut pipeline = pipeline_with_three_peers();
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        pipeline
            .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
            .unwrap();
        pipeline
            .nh_answer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), true, 10)
            .unwrap();
        pipeline.push(PeerId(1)).unwrap();
        let _ = pipeline.take_outbound();

        let accept = Arc::new(PolicyProgram::accept_all());
        pipeline.add_peering(
            peer_info(4, [10, 0, 0, 4], PeerKind::Ebgp, 65004),
            accept.clone(),
            accept,
        );
        pipeline.peering_came_up(PeerId(4)).unwrap();
        while !pipeline.dump_step(PeerId(4), 16).unwrap() {}

        let outbound = pipeline.take_outbound();
        let to_d = updates_for(&outbound, PeerId(4));
        // Externally advertised: our AS prepended.
        assert_eq!(to_d.last().unwrap(), "announce 10.0.0.0/24 via 65000 65001");
    }

    /// Flap damping per RFC 2439: after repeated flaps the prefix is
    /// suppressed and stops propagating.
    #[test]
    fn damping_suppresses_flapping_prefix() {
        let config = PipelineConfig {
            local_as: 65000,
            router_id: Ipv4Addr::new(10, 0, 0, 100),
            cluster_id: Ipv4Addr::new(10, 0, 0, 100),
            damping: DampingConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(config, NextHopResolver::new(None));
        let accept = Arc::new(PolicyProgram::accept_all());
        pipeline.add_peering(
            peer_info(1, [10, 0, 0, 1], PeerKind::Ebgp, 65001),
            accept.clone(),
            accept.clone(),
        );
        pipeline.add_peering(
            peer_info(3, [10, 0, 0, 3], PeerKind::Ibgp, 65000),
            accept.clone(),
            accept,
        );
        let net: Ipv4Net = "10.1.0.0/24".parse().unwrap();
        pipeline
            .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
            .unwrap();
        pipeline
            .nh_answer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), true, 10)
            .unwrap();

        // Announce/withdraw churn, ten seconds apart.
        for _ in 0..6 {
            pipeline.delete_route(PeerId(1), net).unwrap();
            for _ in 0..10 {
                pipeline.damping_tick().unwrap();
            }
            pipeline
                .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
                .unwrap();
            for _ in 0..10 {
                pipeline.damping_tick().unwrap();
            }
        }
        pipeline.push(PeerId(1)).unwrap();
        let outbound = pipeline.take_outbound();
        let to_c = updates_for(&outbound, PeerId(3));
        // The churn ends in suppression: the last visible event for the
        // prefix is its withdrawal, not a re-announce.
        assert!(to_c.last().unwrap().starts_with("withdraw"));

        // Further announcements stay invisible while suppressed.
        pipeline.delete_route(PeerId(1), net).unwrap();
        pipeline
            .add_route(PeerId(1), net, attrs(&[65001], [10, 0, 0, 1]))
            .unwrap();
        pipeline.push(PeerId(1)).unwrap();
        let outbound = pipeline.take_outbound();
        assert!(updates_for(&outbound, PeerId(3))
            .iter()
            .all(|line| !line.starts_with("announce")));
    }
}
