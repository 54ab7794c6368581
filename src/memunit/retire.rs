use log::{debug, trace};

use super::queue::EntryHandle;
use super::speculation::{SrbEntry, REQUIRED_LINES_PER_CHECKPOINT};
use super::types::{ArchState, FenceKind, InsnClass, InsnId, MemOpKind, Segment, Status};
use super::{Effect, MemUnit, RetireStall};

impl MemUnit {
    /// Whether the ROB head `insn` may retire this cycle.
    pub fn check_retire(&self, insn: InsnId, class: InsnClass) -> Result<(), RetireStall> {
        if self.replay_stalls > 0 {
            return Err(RetireStall::ReplayStall {
                remaining: self.replay_stalls,
            });
        }
        let entry = self.queue.entry(insn).filter(|e| e.segment() == Segment::Active);
        let annulled = entry.is_some_and(|e| e.annulled);
        let speculating = self.spec.speculating;

        let allowed = self.config.allowed_checkpoints;
        if speculating
            && allowed > 0
            && class == InsnClass::Atomic
            && !annulled
            && self.spec.checkpoints.len() >= allowed
        {
            return Err(RetireStall::CheckpointLimit);
        }
        let resync = class == InsnClass::Synchronizing || entry.is_some_and(|e| e.force_resync);
        if resync && speculating {
            return Err(RetireStall::ResyncWhileSpeculating);
        }

        match class {
            InsnClass::Fence(kind) => self.may_retire_fence(kind),
            InsnClass::Load => match entry {
                Some(e) if !e.annulled && e.load_value().is_none() => {
                    Err(RetireStall::ValueNotReady)
                }
                _ => Ok(()),
            },
            InsnClass::Store | InsnClass::Atomic => {
                let Some(e) = entry.filter(|e| !e.squashed) else {
                    return Ok(());
                };
                if e.is_abnormal() && !e.annulled {
                    return self.check_store_retirement(insn);
                }
                // a withdrawn value waits for the engine to supply a new one
                if e.paddr().is_unresolved() || e.value.is_none() || e.annulled {
                    return Err(RetireStall::ValueNotReady);
                }
                if e.is_atomic() {
                    if e.status() != Status::Complete {
                        return Err(RetireStall::ValueNotReady);
                    }
                    if !e.store_complete && self.sb_full() {
                        return Err(RetireStall::SendBufferFull);
                    }
                } else if self.sb_full() {
                    return Err(RetireStall::SendBufferFull);
                }
                Ok(())
            }
            InsnClass::Computation | InsnClass::Synchronizing => Ok(()),
        }
    }

    /// Abnormal accesses retire only once their serialization delay has expired; side-effect
    /// stores additionally wait for the send buffer to drain.
    pub fn check_store_retirement(&self, insn: InsnId) -> Result<(), RetireStall> {
        let Some(entry) = self.queue.entry(insn) else {
            return Ok(());
        };
        if entry.annulled || !entry.is_abnormal() {
            return Ok(());
        }
        match entry.extra_latency_timeout {
            Some(timeout) if self.now > timeout => {
                if entry.side_effect && !entry.exception && !self.sb_empty() {
                    Err(RetireStall::SendBufferNotEmpty)
                } else {
                    Ok(())
                }
            }
            _ => Err(RetireStall::AbnormalAccessPending),
        }
    }

    fn may_retire_fence(&self, kind: FenceKind) -> Result<(), RetireStall> {
        match kind {
            FenceKind::StoreStore => {
                if self.config.is_rmo() && !self.sb_empty() {
                    Err(RetireStall::SendBufferNotEmpty)
                } else {
                    Ok(())
                }
            }
            FenceKind::StoreLoad => self.may_retire_store_load(),
            FenceKind::Sync => {
                if self.config.naw_wait_at_sync && self.queue.sbnaw_count() > 0 {
                    return Err(RetireStall::SendBufferNotEmpty);
                }
                self.may_retire_store_load()
            }
        }
    }

    fn may_retire_store_load(&self) -> Result<(), RetireStall> {
        if !self.config.speculative_order {
            return if self.sb_empty() {
                Ok(())
            } else {
                Err(RetireStall::SendBufferNotEmpty)
            };
        }
        if self.sb_full() {
            return Err(RetireStall::SendBufferFull);
        }
        if !self.config.is_sc() && !self.spec.has_budget(self.config.allowed_checkpoints) {
            return Err(RetireStall::CheckpointLimit);
        }
        Ok(())
    }

    /// Retire the ROB head. Memory operations leave the active segment: loads are erased or
    /// kept as checkpoints, stores move to the send buffer, atomics and fences may open a
    /// checkpoint capturing `state`.
    pub fn retire(
        &mut self,
        insn: InsnId,
        class: InsnClass,
        state: &ArchState,
    ) -> Result<(), RetireStall> {
        self.check_retire(insn, class)?;
        self.value_predict_inhibit = false;
        self.stats.retired += 1;
        self.spec.retires_since_checkpoint += 1;

        let mut retired = SrbEntry::new(insn);
        if let Some(handle) = self.queue.find(insn) {
            let active = self
                .queue
                .get(handle)
                .is_some_and(|e| e.segment() == Segment::Active);
            if active {
                self.retire_mem(handle, state, &mut retired);
            }
        }
        retired.has_checkpoint = self.spec.checkpoints.contains_key(&insn);
        trace!("retire {insn} ({class:?}) may_commit={}", retired.may_commit);
        self.spec.srb.push_back(retired);
        Ok(())
    }

    fn retire_mem(&mut self, handle: EntryHandle, state: &ArchState, retired: &mut SrbEntry) {
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        retired.force_resync = entry.force_resync;
        let insn = entry.insn();
        let annulled = entry.annulled;
        let abnormal = entry.is_abnormal();
        let store_complete = entry.store_complete;
        let line = entry
            .paddr()
            .resolved()
            .map(|paddr| self.line_of(paddr))
            .filter(|line| *line != 0);

        match entry.op() {
            MemOpKind::Rmw | MemOpKind::Cas => {
                if annulled {
                    self.erase_entry(handle);
                    return;
                }
                if let Some(line) = line.filter(|_| !abnormal) {
                    self.add_slat_entry(line, insn);
                    retired.slat_line = Some(line);
                }
                if store_complete {
                    self.erase_entry(handle);
                    return;
                }
                debug_assert!(self.config.speculative_order);
                debug!("speculatively retiring atomic {insn}");
                self.queue.move_to(handle, Segment::SpeculativeSend);
                if let Some(entry) = self.queue.get_mut(handle) {
                    entry.issued = false;
                }
                self.create_checkpoint(insn, state);
                self.require_write_permission(handle);
                retired.may_commit = false;
            }
            MemOpKind::Load => {
                let mut speculate = false;
                if let Some(line) = line.filter(|_| !abnormal && !annulled) {
                    if self.needs_load_checkpoint() {
                        debug!("entering SC speculation on {insn}");
                        speculate = true;
                        retired.may_commit = false;
                        self.queue.move_to(handle, Segment::SpeculativeSend);
                        self.queue.set_bypass(handle, true);
                        self.create_checkpoint(insn, state);
                    }
                    self.add_slat_entry(line, insn);
                    retired.slat_line = Some(line);
                }
                if !speculate {
                    self.erase_entry(handle);
                }
            }
            MemOpKind::Store => {
                if annulled || abnormal {
                    let deferred = match (entry.paddr().usable(), entry.value) {
                        (Some(paddr), Some(value))
                            if !annulled && entry.side_effect && !entry.exception =>
                        {
                            Some(Effect::DeferredWrite {
                                paddr,
                                size: entry.size(),
                                value,
                            })
                        }
                        _ => None,
                    };
                    self.effects.extend(deferred);
                    self.erase_entry(handle);
                    return;
                }
                let coalesced = line.is_some_and(|line| {
                    self.queue
                        .predecessor(handle)
                        .and_then(|pred| self.queue.get(pred))
                        .is_some_and(|pred| {
                            pred.op() == MemOpKind::Store
                                && pred.paddr().resolved().map(|p| self.line_of(p)) == Some(line)
                        })
                });
                if coalesced {
                    self.stats.coalesced_stores += 1;
                    if let Some(entry) = self.queue.get_mut(handle) {
                        entry.coalesced = true;
                    }
                }
                let segment = if !self.spec.speculating && self.spec.srb.is_empty() {
                    Segment::CommittedSend
                } else {
                    Segment::SpeculativeSend
                };
                self.queue.move_to(handle, segment);
                self.require_write_permission(handle);
            }
            MemOpKind::Fence => {
                if self.sb_empty() {
                    trace!("fence {insn} retires non-speculatively");
                    self.erase_entry(handle);
                    return;
                }
                debug_assert!(!self.sb_full());
                self.queue.move_to(handle, Segment::SpeculativeSend);
                if !self.config.is_sc() || !self.spec.speculating {
                    debug!("speculatively retiring fence {insn}");
                    self.create_checkpoint(insn, state);
                    retired.may_commit = false;
                }
            }
        }
    }

    /// SC loads that retire past buffered stores must hold a checkpoint.
    fn needs_load_checkpoint(&self) -> bool {
        if !self.config.is_sc() || !self.config.speculative_order {
            return false;
        }
        if !self.spec.speculating {
            return !self.sb_empty();
        }
        if !self.spec.has_budget(self.config.allowed_checkpoints) {
            return false;
        }
        let threshold = self.config.checkpoint_threshold;
        (threshold > 0 && self.spec.retires_since_checkpoint > threshold)
            || self.spec.open_required_lines() > REQUIRED_LINES_PER_CHECKPOINT
    }
}
