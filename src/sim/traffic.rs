use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::Context;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::memunit::{
    ArchState, CoreView, Effect, FenceKind, InsnClass, InsnId, MemOpKind, MemUnit, ResyncReason,
    RobHead, Translation,
};
use crate::sim::config::{SimConfig, TrafficConfig};
use crate::sim::mem_system::CoherentMemory;
use crate::timeq::Cycle;

/// One program operation. `rmw` is an atomic swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    Load { addr: u64, size: u8 },
    Store { addr: u64, size: u8, value: u64 },
    Rmw { addr: u64, size: u8, value: u64 },
    Cas { addr: u64, size: u8, compare: u64, value: u64 },
    Fence { kind: FenceKind },
    Alu,
    Trap,
}

impl TraceOp {
    pub fn class(&self) -> InsnClass {
        match self {
            TraceOp::Load { .. } => InsnClass::Load,
            TraceOp::Store { .. } => InsnClass::Store,
            TraceOp::Rmw { .. } | TraceOp::Cas { .. } => InsnClass::Atomic,
            TraceOp::Fence { kind } => InsnClass::Fence(*kind),
            TraceOp::Alu => InsnClass::Computation,
            TraceOp::Trap => InsnClass::Synchronizing,
        }
    }

    /// Queue entry the operation needs, if any. Only fences that order stores against later
    /// loads leave a marker.
    fn mem_op(&self) -> Option<(MemOpKind, u8)> {
        match self {
            TraceOp::Load { size, .. } => Some((MemOpKind::Load, *size)),
            TraceOp::Store { size, .. } => Some((MemOpKind::Store, *size)),
            TraceOp::Rmw { size, .. } => Some((MemOpKind::Rmw, *size)),
            TraceOp::Cas { size, .. } => Some((MemOpKind::Cas, *size)),
            TraceOp::Fence {
                kind: FenceKind::StoreLoad | FenceKind::Sync,
            } => Some((MemOpKind::Fence, 0)),
            _ => None,
        }
    }

    fn addr(&self) -> Option<u64> {
        match self {
            TraceOp::Load { addr, .. }
            | TraceOp::Store { addr, .. }
            | TraceOp::Rmw { addr, .. }
            | TraceOp::Cas { addr, .. } => Some(*addr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    #[serde(flatten)]
    pub op: TraceOp,
    /// Cycles from dispatch until the address translates.
    #[serde(default)]
    pub address_delay: Cycle,
    /// Cycles from dispatch until store data is available.
    #[serde(default)]
    pub value_delay: Cycle,
    #[serde(default)]
    pub side_effect: bool,
}

impl From<TraceOp> for TraceRecord {
    fn from(op: TraceOp) -> Self {
        Self {
            op,
            address_delay: 0,
            value_delay: 0,
            side_effect: false,
        }
    }
}

pub fn load_trace(path: &Path) -> anyhow::Result<Vec<TraceRecord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read trace {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("cannot parse trace {}", path.display()))
}

/// Random workload over `[base, base + footprint)` with 8-byte aligned accesses.
pub fn generate(config: &TrafficConfig, rng: &mut StdRng) -> Vec<TraceRecord> {
    let slots = (config.footprint / 8).max(1);
    let store_at = config.load_ratio;
    let atomic_at = store_at + config.store_ratio;
    let fence_at = atomic_at + config.atomic_ratio;
    let alu_at = fence_at + config.fence_ratio;
    let mut ops = Vec::with_capacity(config.num_ops);
    for _ in 0..config.num_ops {
        let addr = config.base + rng.gen_range(0..slots) * 8;
        let pick: f64 = rng.gen();
        let op = if pick < store_at {
            TraceOp::Load { addr, size: 8 }
        } else if pick < atomic_at {
            TraceOp::Store {
                addr,
                size: 8,
                value: rng.gen(),
            }
        } else if pick < fence_at {
            if rng.gen_bool(0.5) {
                TraceOp::Rmw {
                    addr,
                    size: 8,
                    value: rng.gen(),
                }
            } else {
                TraceOp::Cas {
                    addr,
                    size: 8,
                    compare: 0,
                    value: rng.gen(),
                }
            }
        } else if pick < alu_at {
            let kind = match rng.gen_range(0..3) {
                0 => FenceKind::StoreStore,
                1 => FenceKind::StoreLoad,
                _ => FenceKind::Sync,
            };
            TraceOp::Fence { kind }
        } else {
            TraceOp::Alu
        };
        ops.push(TraceRecord {
            op,
            address_delay: rng.gen_range(0..=config.max_address_delay),
            value_delay: rng.gen_range(0..=config.max_value_delay),
            side_effect: false,
        });
    }
    ops
}

#[derive(Debug)]
struct RobEntry {
    insn: InsnId,
    index: usize,
    class: InsnClass,
    address_at: Cycle,
    value_at: Cycle,
    address_sent: bool,
    value_sent: bool,
}

/// Retired but not yet committed; enough to restart from it.
#[derive(Debug)]
struct Retired {
    insn: InsnId,
    index: usize,
    checksum_before: u64,
}

/// Out-of-order execution engine replaying a fixed program. Architectural state is the
/// program counter plus a checksum folding in every retired load value, so a rollback that
/// restores the wrong state changes the final checksum.
pub struct TraceEngine {
    program: Vec<TraceRecord>,
    rob: VecDeque<RobEntry>,
    journal: VecDeque<Retired>,
    next_insn: u64,
    fetch: usize,
    checksum: u64,
    dispatch_width: usize,
    retire_width: usize,
    rob_size: usize,
    retired: u64,
    committed: u64,
    rollbacks: u64,
    replayed: u64,
}

impl TraceEngine {
    pub fn new(program: Vec<TraceRecord>, config: &SimConfig) -> Self {
        Self {
            program,
            rob: VecDeque::new(),
            journal: VecDeque::new(),
            next_insn: 1,
            fetch: 0,
            checksum: 0,
            dispatch_width: config.dispatch_width.max(1),
            retire_width: config.retire_width.max(1),
            rob_size: config.rob_size.max(1),
            retired: 0,
            committed: 0,
            rollbacks: 0,
            replayed: 0,
        }
    }

    pub fn finished(&self) -> bool {
        self.fetch >= self.program.len() && self.rob.is_empty() && self.journal.is_empty()
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn retired(&self) -> u64 {
        self.retired
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks
    }

    /// Instructions discarded by rollbacks and resyncs and fetched again.
    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    pub fn core_view(&self) -> CoreView {
        CoreView {
            rob_head: self.rob.front().map(|head| RobHead {
                insn: head.insn,
                class: head.class,
            }),
            rob_len: self.rob.len(),
            live_instructions: self.rob.len() + self.journal.len(),
            spinning: false,
        }
    }

    fn blocked_on_trap(&self) -> bool {
        self.rob
            .back()
            .is_some_and(|entry| entry.class == InsnClass::Synchronizing)
    }

    pub fn dispatch(&mut self, now: Cycle, unit: &mut MemUnit) -> anyhow::Result<()> {
        for _ in 0..self.dispatch_width {
            if self.rob.len() >= self.rob_size || self.blocked_on_trap() {
                break;
            }
            let Some(record) = self.program.get(self.fetch).copied() else {
                break;
            };
            let insn = InsnId(self.next_insn);
            self.next_insn += 1;
            if let Some((op, size)) = record.op.mem_op() {
                unit.insert(insn, op, size, false)?;
            }
            trace!("dispatch {insn} = [{}] {:?}", self.fetch, record.op);
            self.rob.push_back(RobEntry {
                insn,
                index: self.fetch,
                class: record.op.class(),
                address_at: now + record.address_delay,
                value_at: now + record.value_delay,
                address_sent: record.op.addr().is_none(),
                value_sent: !matches!(
                    record.op,
                    TraceOp::Store { .. } | TraceOp::Rmw { .. } | TraceOp::Cas { .. }
                ),
            });
            self.fetch += 1;
        }
        Ok(())
    }

    /// Deliver addresses and store data whose latency has elapsed.
    pub fn execute(&mut self, now: Cycle, unit: &mut MemUnit) -> anyhow::Result<()> {
        for entry in self.rob.iter_mut() {
            let Some(record) = self.program.get(entry.index) else {
                continue;
            };
            if !entry.address_sent && now >= entry.address_at {
                if let Some(addr) = record.op.addr() {
                    let translation = Translation {
                        side_effect: record.side_effect,
                        ..Translation::identity(addr)
                    };
                    unit.resolve_address(entry.insn, translation)?;
                }
                entry.address_sent = true;
            }
            if !entry.value_sent && now >= entry.value_at {
                match record.op {
                    TraceOp::Store { value, .. } | TraceOp::Rmw { value, .. } => {
                        unit.update_store_value(entry.insn, value, None)?
                    }
                    TraceOp::Cas { compare, value, .. } => {
                        unit.update_cas_value(entry.insn, value, compare)?
                    }
                    _ => {}
                }
                entry.value_sent = true;
            }
        }
        Ok(())
    }

    /// Retire from the ROB head. A trap that finds the unit out of step is reported as a resync.
    pub fn retire(&mut self, unit: &mut MemUnit) -> anyhow::Result<Option<ResyncReason>> {
        for _ in 0..self.retire_width {
            let Some(head) = self.rob.front() else {
                break;
            };
            let (insn, index, class) = (head.insn, head.index, head.class);
            if let Err(stall) = unit.check_retire(insn, class) {
                trace!("{insn} stalled at retire: {stall}");
                break;
            }
            if class == InsnClass::Synchronizing {
                if let Err(reason) = unit.handle_trap() {
                    return Ok(Some(reason));
                }
            }
            let value = match class {
                InsnClass::Load | InsnClass::Atomic => unit.retrieve_load_value(insn).ok(),
                _ => None,
            };
            let state = ArchState {
                pc: index as u64,
                regs: vec![self.checksum],
            };
            if let Err(stall) = unit.retire(insn, class, &state) {
                trace!("{insn} stalled at retire: {stall}");
                break;
            }
            self.journal.push_back(Retired {
                insn,
                index,
                checksum_before: self.checksum,
            });
            if let Some(value) = value {
                self.checksum = self.checksum.rotate_left(7) ^ value;
            }
            self.rob.pop_front();
            self.retired += 1;
        }
        Ok(None)
    }

    pub fn apply_effects(
        &mut self,
        effects: Vec<Effect>,
        memory: &mut CoherentMemory,
    ) -> anyhow::Result<()> {
        for effect in effects {
            match effect {
                Effect::Committed(insn) => {
                    while self.journal.front().is_some_and(|r| r.insn <= insn) {
                        self.journal.pop_front();
                        self.committed += 1;
                    }
                }
                Effect::DeferredWrite { paddr, size, value } => {
                    memory.write_deferred(paddr, size, value)?;
                }
                Effect::Rollback { checkpoint, state } => {
                    self.rollbacks += 1;
                    self.journal.retain(|r| r.insn < checkpoint);
                    self.replayed += self.rob.len() as u64;
                    self.rob.clear();
                    self.fetch = state.pc as usize;
                    self.checksum = state.regs.first().copied().unwrap_or(0);
                    debug!("rollback to {checkpoint}, refetch from [{}]", self.fetch);
                }
                Effect::Satisfy(_)
                | Effect::Squash(_)
                | Effect::OverrideResult(_)
                | Effect::ForceResync(_) => {}
            }
        }
        Ok(())
    }

    /// Rebuild from committed state after the unit asked for a resync.
    pub fn recover(
        &mut self,
        reason: &ResyncReason,
        unit: &mut MemUnit,
        memory: &mut CoherentMemory,
    ) -> anyhow::Result<()> {
        let effects = unit.take_effects();
        self.apply_effects(effects, memory)?;
        unit.reset();
        let owed = unit.take_effects();
        self.apply_effects(owed, memory)?;

        if let Some(first) = self.journal.front() {
            self.fetch = first.index;
            self.checksum = first.checksum_before;
        } else if let Some(head) = self.rob.front() {
            self.fetch = head.index;
        }
        self.replayed += (self.journal.len() + self.rob.len()) as u64;
        self.journal.clear();
        self.rob.clear();
        info!("resync ({reason}), restart from [{}]", self.fetch);
        Ok(())
    }
}
