use std::collections::HashMap;

use crate::bgp::route::{AddressFamily, InternalMessage, PeerId, RouteArena, RouteId};
use crate::error::{CoreError, Result};

use super::{Ctx, RouteTable, TableId, TableOp};

/// Scale factor of the figure of merit; one flap adds this much.
pub const MERIT_FIXED: u32 = 1000;

/// Route-flap damping parameters (RFC 2439).
#[derive(Debug, Clone)]
pub struct DampingConfig {
    pub enabled: bool,
    /// Half life in minutes.
    pub half_life: u32,
    /// Maximum hold-down time in minutes.
    pub max_hold_down: u32,
    /// Un-suppress below this merit.
    pub reuse: u32,
    /// Suppress above this merit.
    pub cutoff: u32,
}

impl Default for DampingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            half_life: 15,
            max_hold_down: 60,
            reuse: 750,
            cutoff: 3000,
        }
    }
}

/// The damping clock and its precomputed per-second decay table.
#[derive(Debug)]
pub struct Damping {
    config: DampingConfig,
    /// decay[k] = 2^(-k/halflife) scaled by MERIT_FIXED, per second.
    decay: Vec<u32>,
    tick: u32,
}

impl Damping {
    pub fn new(config: DampingConfig) -> Self {
        let mut damping = Self {
            config,
            decay: Vec::new(),
            tick: 0,
        };
        damping.init();
        damping
    }

    fn init(&mut self) {
        if !self.config.enabled {
            self.decay.clear();
            return;
        }
        let array_size = (self.config.max_hold_down as usize) * 60;
        let decay_1 = (-(1.0 / (self.config.half_life as f64 * 60.0)) * 2f64.ln()).exp();
        let mut decay_i = decay_1;
        self.decay = Vec::with_capacity(array_size);
        for _ in 0..array_size {
            self.decay.push((decay_i * MERIT_FIXED as f64) as u32);
            decay_i *= decay_1;
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn tick(&mut self) {
        self.tick += 1;
    }

    pub fn get_tick(&self) -> u32 {
        self.tick
    }

    /// Merit assigned the first time a route flaps.
    pub fn first_merit(&self) -> u32 {
        MERIT_FIXED
    }

    /// Decay the last merit to now and add one flap's worth.
    pub fn compute_merit(&self, last_time: u32, last_merit: u32) -> u32 {
        let tdiff = (self.tick - last_time) as usize;
        if tdiff >= self.decay.len() {
            MERIT_FIXED
        } else {
            (last_merit * self.decay[tdiff]) / MERIT_FIXED + MERIT_FIXED
        }
    }

    /// Current decayed value without adding a flap.
    pub fn decayed_merit(&self, last_time: u32, last_merit: u32) -> u32 {
        let tdiff = (self.tick - last_time) as usize;
        if tdiff >= self.decay.len() {
            0
        } else {
            (last_merit * self.decay[tdiff]) / MERIT_FIXED
        }
    }

    pub fn cutoff(&self, merit: u32) -> bool {
        merit > self.config.cutoff
    }

    pub fn reuse(&self, merit: u32) -> bool {
        merit > self.config.reuse
    }

    /// Seconds until this merit decays to the reuse threshold, capped at
    /// the maximum hold-down.
    pub fn reuse_time(&self, merit: u32) -> u32 {
        let damp_time = ((merit / self.config.reuse).saturating_sub(1)) * self.config.half_life * 60;
        let max_time = self.config.max_hold_down * 60;
        damp_time.min(max_time)
    }
}

#[derive(Debug)]
struct DampEntry<A: AddressFamily> {
    merit: u32,
    last_time: u32,
    suppressed: bool,
    /// While suppressed, the latest announcement withheld from
    /// downstream: our own arena clone plus its origin and epoch.
    stored: Option<StoredRoute<A>>,
}

#[derive(Debug)]
struct StoredRoute<A: AddressFamily> {
    id: RouteId,
    net: A::Net,
    origin: PeerId,
    genid: u32,
}

/// Route-flap damping stage, one per peering. Tracks a per-prefix figure
/// of merit; flapping prefixes are withheld until the merit decays below
/// the reuse threshold.
#[derive(Debug)]
pub struct DampingTable<A: AddressFamily> {
    id: TableId,
    parent: TableId,
    next: TableId,
    damping: Damping,
    entries: HashMap<A::Net, DampEntry<A>>,
}

impl<A: AddressFamily> DampingTable<A> {
    pub fn new(id: TableId, config: DampingConfig) -> Self {
        Self {
            id,
            parent: 0,
            next: 0,
            damping: Damping::new(config),
            entries: HashMap::new(),
        }
    }

    pub fn set_parent(&mut self, parent: TableId) {
        self.parent = parent;
    }

    pub fn set_next(&mut self, next: TableId) {
        self.next = next;
    }

    pub fn damping(&self) -> &Damping {
        &self.damping
    }

    pub fn is_suppressed(&self, net: &A::Net) -> bool {
        self.entries.get(net).map(|e| e.suppressed).unwrap_or(false)
    }

    /// One flap on `net`; returns the updated merit.
    fn flap(&mut self, net: A::Net) -> u32 {
        let tick = self.damping.get_tick();
        let entry = self.entries.entry(net).or_insert(DampEntry {
            merit: 0,
            last_time: tick,
            suppressed: false,
            stored: None,
        });
        entry.merit = if entry.merit == 0 {
            self.damping.first_merit()
        } else {
            self.damping.compute_merit(entry.last_time, entry.merit)
        };
        entry.last_time = tick;
        entry.merit
    }

    /// Advance the clock one second and release entries whose merit fell
    /// to the reuse threshold. Driven by the node's periodic timer.
    pub fn tick(&mut self, ctx: &mut Ctx<A>) -> Result<Vec<TableOp<A>>> {
        self.damping.tick();
        if !self.damping.enabled() {
            return Ok(Vec::new());
        }
        let mut ops = Vec::new();
        let mut prune: Vec<A::Net> = Vec::new();
        for (net, entry) in self.entries.iter_mut() {
            let now = self.damping.decayed_merit(entry.last_time, entry.merit);
            if entry.suppressed && !self.damping.reuse(now) {
                entry.suppressed = false;
                if let Some(stored) = entry.stored.take() {
                    let msg =
                        InternalMessage::new(stored.id, stored.net, stored.origin, stored.genid);
                    ops.push(TableOp::Add {
                        to: self.next,
                        caller: self.id,
                        msg,
                    });
                    ctx.out.free_after.push(stored.id);
                }
            }
            if !entry.suppressed && entry.stored.is_none() && now == 0 {
                prune.push(*net);
            }
        }
        for net in prune {
            self.entries.remove(&net);
        }
        Ok(ops)
    }

    pub fn release(self, arena: &mut RouteArena<A>) {
        for entry in self.entries.into_values() {
            if let Some(stored) = entry.stored {
                arena.free(stored.id);
            }
        }
    }
}

impl<A: AddressFamily> RouteTable<A> for DampingTable<A> {
    fn name(&self) -> String {
        "damping".to_string()
    }

    fn check_caller(&self, caller: TableId) -> Result<()> {
        if caller != self.parent {
            return Err(CoreError::fatal(format!(
                "damping: caller {} is not parent {}",
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
        if !self.damping.enabled() {
            return Ok(vec![TableOp::Add {
                to: self.next,
                caller: self.id,
                msg,
            }]);
        }
        // A re-announce after withdraw is a flap; a first announce only
        // seeds the entry.
        let known = self.entries.contains_key(&msg.net);
        let merit = self.flap(msg.net);
        let entry = self.entries.get_mut(&msg.net).unwrap();
        if entry.suppressed || (known && self.damping.cutoff(merit)) {
            // Withheld: remember the latest announcement for reuse.
            // Entering suppression on an add means downstream already saw
            // the withdraw half of the flap, so nothing to retract.
            let clone = ctx.arena.clone_entry(msg.id);
            let stored = StoredRoute {
                id: clone,
                net: msg.net,
                origin: msg.origin,
                genid: msg.genid,
            };
            if let Some(prev) = entry.stored.replace(stored) {
                ctx.arena.free(prev.id);
            }
            entry.suppressed = true;
            ctx.out.filtered = true;
            return Ok(Vec::new());
        }
        Ok(vec![TableOp::Add {
            to: self.next,
            caller: self.id,
            msg,
        }])
    }

    fn replace_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        if !self.damping.enabled() {
            return Ok(vec![TableOp::Replace {
                to: self.next,
                caller: self.id,
                old,
                new,
            }]);
        }
        let merit = self.flap(new.net);
        let entry = self.entries.get_mut(&new.net).unwrap();
        let crossing = !entry.suppressed && self.damping.cutoff(merit);
        if entry.suppressed || crossing {
            let clone = ctx.arena.clone_entry(new.id);
            let stored = StoredRoute {
                id: clone,
                net: new.net,
                origin: new.origin,
                genid: new.genid,
            };
            if let Some(prev) = entry.stored.replace(stored) {
                ctx.arena.free(prev.id);
            }
            entry.suppressed = true;
            ctx.out.filtered = true;
            if crossing {
                // Crossing into suppression: retract what downstream has.
                return Ok(vec![TableOp::Delete {
                    to: self.next,
                    caller: self.id,
                    msg: old,
                }]);
            }
            return Ok(Vec::new());
        }
        Ok(vec![TableOp::Replace {
            to: self.next,
            caller: self.id,
            old,
            new,
        }])
    }

    fn delete_route(
        &mut self,
        ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
    ) -> Result<Vec<TableOp<A>>> {
        if !self.damping.enabled() {
            return Ok(vec![TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg,
            }]);
        }
        if msg.from_previous_peering {
            // Session loss is not a flap against the prefix.
            if let Some(entry) = self.entries.get_mut(&msg.net) {
                if let Some(stored) = entry.stored.take() {
                    ctx.arena.free(stored.id);
                }
                let was_suppressed = entry.suppressed;
                entry.suppressed = false;
                if was_suppressed {
                    return Ok(Vec::new());
                }
            }
            return Ok(vec![TableOp::Delete {
                to: self.next,
                caller: self.id,
                msg,
            }]);
        }
        let _merit = self.flap(msg.net);
        let entry = self.entries.get_mut(&msg.net).unwrap();
        if entry.suppressed {
            // Downstream never saw the suppressed announcement.
            if let Some(stored) = entry.stored.take() {
                ctx.arena.free(stored.id);
            }
            return Ok(Vec::new());
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
        _ctx: &mut Ctx<A>,
        _caller: TableId,
        msg: InternalMessage<A>,
        dump_peer: PeerId,
    ) -> Result<Vec<TableOp<A>>> {
        // Suppressed prefixes are invisible downstream, dumps included.
        if self.is_suppressed(&msg.net) {
            return Ok(Vec::new());
        }
        Ok(vec![TableOp::Dump {
            to: self.next,
            caller: self.id,
            msg,
            dump_peer,
        }])
    }

    fn lookup_route(&self, _arena: &RouteArena<A>, _net: &A::Net) -> Option<(RouteId, u32)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn damping() -> Damping {
        Damping::new(DampingConfig {
            enabled: true,
            half_life: 15,
            max_hold_down: 60,
            reuse: 750,
            cutoff: 3000,
        })
    }

    #[test]
    fn merit_accumulates_and_decays() {
        let mut d = damping();
        let mut merit = d.first_merit();
        let mut last = d.get_tick();
        // Four more flaps in quick succession push past the cutoff.
        for _ in 0..4 {
            for _ in 0..10 {
                d.tick();
            }
            merit = d.compute_merit(last, merit);
            last = d.get_tick();
        }
        assert!(d.cutoff(merit), "merit {} should exceed cutoff", merit);

        // One half life decays it by half.
        for _ in 0..(15 * 60) {
            d.tick();
        }
        let decayed = d.decayed_merit(last, merit);
        assert!(decayed > merit * 45 / 100 && decayed < merit * 55 / 100);
    }

    #[test]
    fn reuse_time_is_capped() {
        let d = damping();
        assert_eq!(d.reuse_time(1500), 900);
        assert_eq!(d.reuse_time(40_000), 60 * 60);
    }
}
