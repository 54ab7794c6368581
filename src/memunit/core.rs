use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, info, trace};

use crate::sim::config::MemUnitConfig;
use crate::sim::perf_log::RunContext;
use crate::timeq::Cycle;

use super::arbiter::PortArbiter;
use super::mshr::{MshrTable, Released};
use super::queue::{EntryHandle, MemQueue, MemQueueEntry};
use super::speculation::Speculation;
use super::types::{CoreView, InsnId, MemOpKind, PhysAddr, Segment, Status, Translation};
use super::{
    Effect, MemMessage, MemUnit, MemUnitError, MemUnitStats, MessageKind, ResyncReason,
};

impl MemUnit {
    pub fn new(config: MemUnitConfig, ctx: Arc<RunContext>) -> Self {
        debug_assert!(config.coherence_unit.is_power_of_two());
        Self {
            arbiter: PortArbiter::new(config.in_order_memory),
            config,
            ctx,
            now: 0,
            core: CoreView::default(),
            queue: MemQueue::new(),
            mshrs: MshrTable::new(),
            spec: Speculation::default(),
            outstanding_prefetches: HashMap::new(),
            replies: VecDeque::new(),
            memory_ports: VecDeque::new(),
            snoop_ports: VecDeque::new(),
            effects: Vec::new(),
            partial_snoops: 0,
            replay_stalls: 0,
            value_predict_inhibit: false,
            stats: MemUnitStats::default(),
        }
    }

    pub fn config(&self) -> &MemUnitConfig {
        &self.config
    }

    pub fn stats(&self) -> &MemUnitStats {
        &self.stats
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    /// Add a memory operation in program order. `bypass` requests a non-allocating write and is
    /// honoured only when `naw_bypass_sb` is configured.
    pub fn insert(
        &mut self,
        insn: InsnId,
        op: MemOpKind,
        size: u8,
        bypass: bool,
    ) -> Result<(), MemUnitError> {
        if !op.is_marker() && !matches!(size, 1 | 2 | 4 | 8) {
            return Err(MemUnitError::WrongKind {
                insn,
                expected: "1, 2, 4 or 8 byte",
            });
        }
        let bypass = bypass && self.config.naw_bypass_sb && op == MemOpKind::Store;
        self.queue.insert(insn, op, size, bypass)?;
        self.stats.inserted += 1;
        trace!("insert {insn} {op:?} size={size} bypass={bypass}");
        Ok(())
    }

    fn handle_of(&self, insn: InsnId) -> Result<EntryHandle, MemUnitError> {
        self.queue
            .find(insn)
            .ok_or(MemUnitError::UnknownInstruction(insn))
    }

    pub fn entry(&self, insn: InsnId) -> Option<&MemQueueEntry> {
        self.queue.entry(insn)
    }

    pub fn status(&self, insn: InsnId) -> Option<Status> {
        self.entry(insn).map(MemQueueEntry::status)
    }

    /// Deliver the translation of an entry's address. An unchanged address is a no-op; a changed
    /// one withdraws whatever was derived from the old address and starts over.
    pub fn resolve_address(
        &mut self,
        insn: InsnId,
        translation: Translation,
    ) -> Result<(), MemUnitError> {
        let handle = self.handle_of(insn)?;
        let Some(entry) = self.queue.get(handle) else {
            return Err(MemUnitError::UnknownInstruction(insn));
        };
        if entry.is_marker() {
            return Err(MemUnitError::WrongKind {
                insn,
                expected: "memory access",
            });
        }
        if entry.vaddr == Some(translation.vaddr) && !entry.paddr().is_unresolved() {
            return Ok(());
        }
        if entry.is_store() && entry.value.is_some() {
            self.resnoop_dependant_loads(handle);
        }
        self.unresolve(handle);
        self.update_vaddr(handle, translation);

        let Some(entry) = self.queue.get(handle) else {
            return Ok(());
        };
        let (load, store, atomic) = (entry.is_load(), entry.is_store(), entry.is_atomic());
        match entry.status() {
            Status::Complete | Status::IssuedToMemory => {
                self.do_load(handle);
                if store {
                    self.do_store(handle);
                }
            }
            Status::AwaitingIssue | Status::AwaitingPort => {
                if load {
                    self.do_load(handle);
                }
                if store {
                    self.do_store(handle);
                }
            }
            Status::AwaitingValue => {
                if atomic {
                    self.do_load(handle);
                }
            }
            Status::Annulled | Status::AwaitingAddress => {}
        }
        Ok(())
    }

    fn unresolve(&mut self, handle: EntryHandle) {
        let Some(entry) = self.queue.get_mut(handle) else {
            return;
        };
        let insn = entry.insn();
        let squash = entry.is_load() && entry.load_value().is_some();
        if squash {
            entry.set_load_value(None);
        }
        entry.issued = false;
        if squash {
            self.squash(insn);
        }
        self.break_mshr_link(handle);
        self.queue.set_paddr(handle, PhysAddr::Unresolved);
    }

    fn update_vaddr(&mut self, handle: EntryHandle, translation: Translation) {
        let paddr = match translation.paddr {
            Some(paddr) => PhysAddr::At(paddr),
            None => PhysAddr::Invalid,
        };
        self.queue.set_paddr(handle, paddr);
        let Some(entry) = self.queue.get_mut(handle) else {
            return;
        };
        entry.vaddr = Some(translation.vaddr);
        entry.side_effect = translation.side_effect;
        entry.non_cacheable = translation.non_cacheable;
        entry.exception = translation.exception || translation.paddr.is_none();
        let insn = entry.insn();
        if entry.side_effect {
            entry.force_resync = true;
            self.effects.push(Effect::ForceResync(insn));
        }
        let early = self.config.prefetch_early
            && entry.op() == MemOpKind::Store
            && !entry.is_abnormal()
            && entry.paddr().usable().is_some();
        if early {
            self.request_store_prefetch(handle);
        }
    }

    /// Supply (or change) a store's data. For an RMW `extended` carries the operand read from
    /// memory as seen by the engine.
    pub fn update_store_value(
        &mut self,
        insn: InsnId,
        value: u64,
        extended: Option<u64>,
    ) -> Result<(), MemUnitError> {
        let handle = self.handle_of(insn)?;
        let Some(entry) = self.queue.get_mut(handle) else {
            return Err(MemUnitError::UnknownInstruction(insn));
        };
        if !entry.is_store() {
            return Err(MemUnitError::WrongKind {
                insn,
                expected: "store",
            });
        }
        entry.annulled = entry.squashed;
        let previous = entry.value.replace(value);
        if let Some(extended) = extended {
            entry.extended_value = Some(extended);
        }
        if previous != Some(value) {
            self.do_store(handle);
        }
        Ok(())
    }

    /// A CAS writes `value` only if memory holds `compare`; once the old value is known the store
    /// half carries whichever value memory ends up with.
    pub fn update_cas_value(
        &mut self,
        insn: InsnId,
        value: u64,
        compare: u64,
    ) -> Result<(), MemUnitError> {
        let handle = self.handle_of(insn)?;
        let Some(entry) = self.queue.get_mut(handle) else {
            return Err(MemUnitError::UnknownInstruction(insn));
        };
        if entry.op() != MemOpKind::Cas {
            return Err(MemUnitError::WrongKind {
                insn,
                expected: "compare-and-swap",
            });
        }
        entry.annulled = entry.squashed;
        entry.compare_value = Some(compare);
        let written = match entry.extended_value {
            Some(old) if old != compare => old,
            _ => value,
        };
        let previous = entry.value.replace(written);
        if previous != Some(written) {
            self.do_store(handle);
        }
        Ok(())
    }

    /// Withdraw a store's data, e.g. because its source operand was squashed.
    pub fn annul_store_value(&mut self, insn: InsnId) -> Result<(), MemUnitError> {
        let handle = self.handle_of(insn)?;
        let Some(entry) = self.queue.get_mut(handle) else {
            return Err(MemUnitError::UnknownInstruction(insn));
        };
        if !entry.is_store() {
            return Err(MemUnitError::WrongKind {
                insn,
                expected: "store",
            });
        }
        if !entry.annulled {
            entry.annulled = true;
            entry.issued = false;
            self.resnoop_dependant_loads(handle);
        }
        Ok(())
    }

    /// Squash an instruction that has not retired. The entry stops participating immediately
    /// and is swept at the end of the next cycle.
    pub fn annul(&mut self, insn: InsnId) -> Result<(), MemUnitError> {
        let handle = self.handle_of(insn)?;
        let Some(entry) = self.queue.get_mut(handle) else {
            return Err(MemUnitError::UnknownInstruction(insn));
        };
        if entry.segment() != Segment::Active {
            debug!("ignoring annul of retired {insn}");
            return Ok(());
        }
        if entry.squashed {
            return Ok(());
        }
        let withdrawn = entry.annulled;
        entry.annulled = true;
        entry.squashed = true;
        entry.issued = false;
        let store = entry.is_store();
        if entry.partial_snoop {
            entry.partial_snoop = false;
            self.partial_snoops -= 1;
        }
        self.break_mshr_link(handle);
        self.arbiter.kill_store_prefetch(insn);
        if store && !withdrawn {
            self.update_dependant_loads(handle);
        }
        Ok(())
    }

    pub fn retrieve_load_value(&self, insn: InsnId) -> Result<u64, MemUnitError> {
        let entry = self
            .entry(insn)
            .ok_or(MemUnitError::UnknownInstruction(insn))?;
        entry
            .load_value()
            .ok_or(MemUnitError::ValueNotReady(insn))
    }

    pub fn retrieve_extended_load_value(&self, insn: InsnId) -> Result<u64, MemUnitError> {
        let entry = self
            .entry(insn)
            .ok_or(MemUnitError::UnknownInstruction(insn))?;
        entry
            .extended_value
            .ok_or(MemUnitError::ValueNotReady(insn))
    }

    /// A trap is taken once everything younger has been squashed; a live active entry at this
    /// point means the engine and the unit disagree.
    pub fn handle_trap(&mut self) -> Result<(), ResyncReason> {
        let entries = self
            .queue
            .segment_handles(Segment::Active)
            .into_iter()
            .filter_map(|h| self.queue.get(h))
            .filter(|entry| !entry.squashed)
            .count();
        if entries > 0 {
            self.stats.resyncs += 1;
            info!("trap with {entries} live active entries");
            return Err(ResyncReason::StrandedActiveSegment { entries });
        }
        Ok(())
    }

    pub fn cycle(&mut self, now: Cycle, core: CoreView) -> Result<(), ResyncReason> {
        self.now = now;
        self.core = core;
        let result = self.step();
        if let Err(reason) = &result {
            self.stats.resyncs += 1;
            info!("cycle {now}: resync ({reason})");
        }
        result
    }

    fn step(&mut self) -> Result<(), ResyncReason> {
        self.process_replies();
        self.issue_partial_snoop();
        self.issue_store();
        self.issue_atomic();
        self.issue_atomic_spec_write();
        self.issue_special();
        self.check_extra_latency_timeout();
        self.value_predict_atomic();
        self.resolve_checkpoint();
        self.arbitrate();
        if self.replay_stalls > 0 {
            self.replay_stalls -= 1;
            self.stats.replay_stall_cycles += 1;
        }
        self.commit()?;
        self.sweep_squashed();

        let live = self.core.live_instructions;
        if live > self.config.max_live_instructions {
            return Err(ResyncReason::RunawayInstructions { live });
        }
        Ok(())
    }

    fn sweep_squashed(&mut self) {
        for handle in self.queue.segment_handles(Segment::Active) {
            if self.queue.get(handle).is_some_and(|entry| entry.squashed) {
                self.erase_entry(handle);
            }
        }
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn pop_memory_op(&mut self) -> Option<MemMessage> {
        self.memory_ports.pop_front()
    }

    pub fn pop_snoop_op(&mut self) -> Option<MemMessage> {
        self.snoop_ports.pop_front()
    }

    pub fn can_push_reply(&self) -> bool {
        self.replies.len() < self.reply_capacity()
    }

    fn reply_capacity(&self) -> usize {
        self.config.num_memory_ports + self.config.num_snoop_ports
    }

    pub fn push_reply(&mut self, message: MemMessage) -> Result<(), MemUnitError> {
        if !message.kind.is_inbound() {
            return Err(MemUnitError::NotInbound(message.kind));
        }
        if !self.can_push_reply() {
            return Err(MemUnitError::RepliesFull {
                capacity: self.reply_capacity(),
            });
        }
        self.replies.push_back(message);
        Ok(())
    }

    /// Drop all speculative state after a resync. Stores that were already committed still owe
    /// memory their data and are reported as deferred writes.
    pub fn reset(&mut self) {
        self.effects.clear();
        for handle in self.queue.segment_handles(Segment::CommittedSend) {
            let Some(entry) = self.queue.get(handle) else {
                continue;
            };
            if !entry.is_store() || entry.store_complete {
                continue;
            }
            if let (Some(paddr), Some(value)) = (entry.paddr().usable(), entry.value) {
                self.effects.push(Effect::DeferredWrite {
                    paddr,
                    size: entry.size(),
                    value,
                });
            }
        }
        self.queue.clear();
        self.mshrs.clear();
        self.arbiter.clear();
        self.spec = Speculation::default();
        self.outstanding_prefetches.clear();
        self.replies.clear();
        self.memory_ports.clear();
        self.snoop_ports.clear();
        self.partial_snoops = 0;
        self.replay_stalls = 0;
        self.value_predict_inhibit = false;
        debug!("memory unit reset at cycle {}", self.now);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.mshrs.is_empty()
    }

    pub fn lsq_count(&self) -> usize {
        self.queue.lsq_count()
    }

    pub fn sb_count(&self) -> usize {
        self.queue.sb_count()
    }

    pub fn sbnaw_count(&self) -> usize {
        self.queue.sbnaw_count()
    }

    pub fn mshr_count(&self) -> usize {
        self.mshrs.len()
    }

    pub fn outstanding_store_prefetches(&self) -> usize {
        self.outstanding_prefetches.len()
    }

    pub fn partial_snoops_outstanding(&self) -> usize {
        self.partial_snoops
    }

    pub fn replay_stalls(&self) -> u32 {
        self.replay_stalls
    }

    pub fn sb_empty(&self) -> bool {
        self.queue.sb_count() == 0
    }

    pub fn sb_full(&self) -> bool {
        let size = self.config.sb_size;
        if size == 0 {
            return false;
        }
        if self.config.is_rmo() {
            // relaxed stores drain out of order, so only lines still lacking permission count
            self.spec.sb_false_count >= size || self.queue.sb_count() >= size
        } else {
            self.queue.sb_count() >= size
                || (self.config.speculative_order && self.spec.sb_lines.len() > size / 8)
        }
    }

    pub(super) fn has_memory_port(&self) -> bool {
        self.memory_ports.len() < self.config.num_memory_ports
    }

    pub(super) fn has_snoop_buffer(&self) -> bool {
        self.snoop_ports.len() < self.config.num_snoop_ports
    }

    pub(super) fn line_of(&self, paddr: u64) -> u64 {
        super::types::line_of(paddr, self.config.coherence_unit)
    }

    pub(super) fn satisfy(&mut self, insn: InsnId) {
        self.effects.push(Effect::Satisfy(insn));
    }

    pub(super) fn squash(&mut self, insn: InsnId) {
        self.effects.push(Effect::Squash(insn));
    }

    /// Requests travel on the memory ports, snoop answers on the snoop ports.
    pub(super) fn send(&mut self, message: MemMessage) {
        if is_request(message.kind) {
            self.memory_ports.push_back(message);
        } else {
            self.snoop_ports.push_back(message);
        }
    }

    pub(super) fn break_mshr_link(&mut self, handle: EntryHandle) {
        let Some(entry) = self.queue.get_mut(handle) else {
            return;
        };
        let Some(paddr) = entry.mshr.take() else {
            return;
        };
        if let Some(released) = self.mshrs.detach(paddr, handle) {
            trace!("miss entry {paddr:#x} dropped without waiters");
            self.wake(released);
        }
    }

    /// Resume work that was parked behind a miss entry that has gone away.
    pub(super) fn wake(&mut self, released: Released) {
        for insn in released.blocked_ops {
            if let Some(handle) = self.queue.find(insn) {
                self.request_port(handle);
            }
        }
        for insn in released.blocked_prefetches {
            if let Some(handle) = self.queue.find(insn) {
                self.request_store_prefetch(handle);
            }
        }
    }

    /// Remove an entry together with everything that refers to it.
    pub(super) fn erase_entry(&mut self, handle: EntryHandle) {
        self.break_mshr_link(handle);
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        let insn = entry.insn();
        let partial = entry.partial_snoop;
        let held_permission = entry.segment() != Segment::Active && entry.is_store();
        let paddr = entry.paddr().usable();
        if partial {
            self.partial_snoops -= 1;
        }
        if held_permission {
            if let Some(paddr) = paddr {
                self.unrequire_write_permission(paddr);
            }
        }
        self.arbiter.kill_store_prefetch(insn);
        self.queue.erase(handle);
        trace!("erase {insn}");
    }
}

fn is_request(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::LoadRequest
            | MessageKind::StoreRequest
            | MessageKind::AtomicPreloadRequest
            | MessageKind::RmwRequest
            | MessageKind::CasRequest
            | MessageKind::StorePrefetchRequest
    )
}
