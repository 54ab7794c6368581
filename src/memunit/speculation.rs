use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use log::{debug, info, trace};

use super::mshr::Released;
use super::queue::EntryHandle;
use super::types::{ArchState, InsnId, Paddr, Segment, Status};
use super::{Effect, MemUnit, ResyncReason};

/// Speculation failures are declared only after this many permission losses on one checkpoint.
const LOST_PERMISSION_LIMIT: u32 = 5;
/// Under SC a checkpoint that needs more lines than this makes the next load open a new one.
pub(super) const REQUIRED_LINES_PER_CHECKPOINT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    Invalidate,
    Downgrade,
    Replacement,
}

/// Snapshot taken when an instruction retires past an ordering point it cannot yet prove safe.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    state: ArchState,
    /// Line → first instruction that needed write permission on it.
    required: BTreeMap<Paddr, InsnId>,
    held: BTreeSet<Paddr>,
    lost: u32,
}

impl Checkpoint {
    fn new(state: ArchState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &ArchState {
        &self.state
    }

    pub fn required_lines(&self) -> usize {
        self.required.len()
    }

    pub fn held_lines(&self) -> usize {
        self.held.len()
    }

    pub fn requires(&self, line: Paddr) -> bool {
        self.required.contains_key(&line)
    }

    pub fn lost_permissions(&self) -> u32 {
        self.lost
    }

    /// All required permissions are on chip.
    pub fn is_satisfied(&self) -> bool {
        self.held.len() == self.required.len()
    }
}

/// A retired instruction waiting to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SrbEntry {
    pub insn: InsnId,
    pub may_commit: bool,
    pub has_checkpoint: bool,
    pub slat_line: Option<Paddr>,
    pub force_resync: bool,
}

impl SrbEntry {
    pub fn new(insn: InsnId) -> Self {
        Self {
            insn,
            may_commit: true,
            has_checkpoint: false,
            slat_line: None,
            force_resync: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct LinePermission {
    /// Send-buffer stores and atomics to the line.
    pub count: usize,
    pub held: bool,
}

#[derive(Debug, Default)]
pub(super) struct Speculation {
    pub checkpoints: BTreeMap<InsnId, Checkpoint>,
    pub open: Option<InsnId>,
    pub speculating: bool,
    /// Oldest instruction known to have violated ordering; a rollback is pending while set.
    pub violator: Option<InsnId>,
    pub retires_since_checkpoint: usize,
    pub srb: VecDeque<SrbEntry>,
    /// Speculatively retired loads and atomics, by coherence line.
    pub slat: BTreeSet<(Paddr, InsnId)>,
    pub sb_lines: HashMap<Paddr, LinePermission>,
    /// Tracked lines whose write permission is not on chip.
    pub sb_false_count: usize,
}

impl Speculation {
    pub fn has_budget(&self, allowed: usize) -> bool {
        allowed == 0 || self.checkpoints.len() < allowed
    }

    pub fn open_required_lines(&self) -> usize {
        self.open
            .and_then(|insn| self.checkpoints.get(&insn))
            .map(Checkpoint::required_lines)
            .unwrap_or(0)
    }
}

impl MemUnit {
    pub fn is_speculating(&self) -> bool {
        self.spec.speculating
    }

    pub fn checkpoint_count(&self) -> usize {
        self.spec.checkpoints.len()
    }

    pub fn checkpoint(&self, insn: InsnId) -> Option<&Checkpoint> {
        self.spec.checkpoints.get(&insn)
    }

    pub fn abort_pending(&self) -> Option<InsnId> {
        self.spec.violator
    }

    /// Retired instructions that have not committed yet.
    pub fn srb_len(&self) -> usize {
        self.spec.srb.len()
    }

    pub fn slat_len(&self) -> usize {
        self.spec.slat.len()
    }

    pub fn holds_write_permission(&self, paddr: Paddr) -> bool {
        let line = self.line_of(paddr);
        self.spec.sb_lines.get(&line).is_some_and(|p| p.held)
    }

    pub(super) fn create_checkpoint(&mut self, insn: InsnId, state: &ArchState) {
        let allowed = self.config.allowed_checkpoints;
        let fresh = self
            .spec
            .checkpoints
            .insert(insn, Checkpoint::new(state.clone()))
            .is_none();
        assert!(fresh, "{insn} already owns a checkpoint");
        assert!(
            allowed == 0 || self.spec.checkpoints.len() <= allowed,
            "checkpoint budget of {allowed} exceeded"
        );
        self.stats.checkpoints_created += 1;
        self.stats.max_checkpoints = self
            .stats
            .max_checkpoints
            .max(self.spec.checkpoints.len() as u64);
        self.spec.open = Some(insn);
        self.spec.retires_since_checkpoint = 0;
        if !self.spec.speculating {
            debug!("start speculating at {insn}");
            self.spec.speculating = true;
            self.spec.violator = None;
        }
    }

    pub(super) fn free_checkpoint(&mut self, insn: InsnId) {
        let removed = self.spec.checkpoints.remove(&insn);
        debug_assert!(removed.is_some(), "{insn} has no checkpoint to free");
        if self.spec.open == Some(insn) {
            self.spec.open = None;
        }
        if self.spec.speculating
            && self.spec.violator.is_none()
            && self.spec.checkpoints.is_empty()
        {
            debug!("speculation ended successfully at {insn}");
            self.spec.speculating = false;
        }
    }

    pub(super) fn require_write_permission(&mut self, handle: EntryHandle) {
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        let Some(paddr) = entry.paddr().usable() else {
            return;
        };
        let (insn, atomic) = (entry.insn(), entry.is_atomic());
        let line = self.line_of(paddr);
        let permission = self.spec.sb_lines.entry(line).or_default();
        permission.count += 1;
        if permission.count == 1 && !permission.held {
            self.spec.sb_false_count += 1;
        }
        let held = permission.held;
        if !held {
            self.request_store_prefetch(handle);
        }
        let tracked = self.config.is_sc() || atomic;
        if let Some(checkpoint) = self
            .spec
            .open
            .filter(|_| tracked)
            .and_then(|open| self.spec.checkpoints.get_mut(&open))
        {
            checkpoint.required.entry(line).or_insert(insn);
            if held {
                checkpoint.held.insert(line);
            }
        }
    }

    pub(super) fn unrequire_write_permission(&mut self, paddr: Paddr) {
        let line = self.line_of(paddr);
        let Some(permission) = self.spec.sb_lines.get_mut(&line) else {
            return;
        };
        permission.count = permission.count.saturating_sub(1);
        if permission.count == 0 {
            trace!("stop tracking line {line:#x}");
            if !permission.held {
                self.spec.sb_false_count -= 1;
            }
            self.spec.sb_lines.remove(&line);
        }
    }

    pub(super) fn acquire_write_permission(&mut self, line: Paddr) {
        let Some(permission) = self.spec.sb_lines.get_mut(&line) else {
            return;
        };
        if !permission.held {
            trace!("write permission for {line:#x} on chip");
            self.spec.sb_false_count -= 1;
        }
        permission.held = true;
        for checkpoint in self.spec.checkpoints.values_mut() {
            if checkpoint.required.contains_key(&line) {
                checkpoint.held.insert(line);
            }
        }
    }

    pub(super) fn lose_write_permission(&mut self, reason: LossReason, line: Paddr) {
        let Some(permission) = self.spec.sb_lines.get_mut(&line) else {
            return;
        };
        if permission.held {
            match reason {
                LossReason::Invalidate => self.stats.invalidate_hit_sb += 1,
                LossReason::Downgrade => self.stats.downgrade_hit_sb += 1,
                LossReason::Replacement => self.stats.replacement_hit_sb += 1,
            }
            debug!("{reason:?} took write permission for {line:#x} from the send buffer");
            self.spec.sb_false_count += 1;
        }
        permission.held = false;

        let mut violators = Vec::new();
        let mut rerequest = None;
        for checkpoint in self.spec.checkpoints.values_mut() {
            if !checkpoint.held.remove(&line) {
                continue;
            }
            checkpoint.lost += 1;
            let Some(&requirer) = checkpoint.required.get(&line) else {
                continue;
            };
            if checkpoint.lost > LOST_PERMISSION_LIMIT {
                violators.push(requirer);
            } else if rerequest.is_none() {
                rerequest = Some(requirer);
            }
        }
        for violator in violators {
            self.stats.permission_aborts += 1;
            self.request_abort(violator);
        }
        if let Some(handle) = rerequest.and_then(|insn| self.queue.find(insn)) {
            self.request_store_prefetch(handle);
        }
    }

    /// Schedule a rollback; the oldest violator wins.
    pub(super) fn request_abort(&mut self, insn: InsnId) {
        match self.spec.violator {
            Some(current) if current <= insn => {}
            _ => {
                debug!("abort requested by {insn}");
                self.spec.violator = Some(insn);
            }
        }
    }

    /// Allow a retired instruction to commit.
    pub(super) fn resolve_speculation(&mut self, insn: InsnId) {
        if let Some(entry) = self.spec.srb.iter_mut().find(|entry| entry.insn == insn) {
            entry.may_commit = true;
        }
    }

    pub(super) fn add_slat_entry(&mut self, line: Paddr, insn: InsnId) {
        self.spec.slat.insert((line, insn));
    }

    pub(super) fn resolve_checkpoint(&mut self) {
        // a pending rollback may target the front checkpoint; it must stay unresolved
        if self.spec.violator.is_some() {
            return;
        }
        let Some(front) = self.queue.front() else {
            return;
        };
        let Some(entry) = self.queue.get(front) else {
            return;
        };
        if entry.segment() != Segment::SpeculativeSend || entry.speculated_value {
            return;
        }
        let insn = entry.insn();
        let (atomic, load, marker) = (entry.is_atomic(), entry.is_load(), entry.is_marker());
        let Some(checkpoint) = self.spec.checkpoints.get(&insn) else {
            return;
        };
        if !checkpoint.is_satisfied() {
            return;
        }
        trace!("resolving checkpoint {insn}");
        self.resolve_speculation(insn);
        if atomic || marker {
            self.queue.move_to(front, Segment::CommittedSend);
        } else if load {
            self.erase_entry(front);
        }
    }

    /// Commit resolved instructions in order, rolling back first if a violation is pending.
    pub(super) fn commit(&mut self) -> Result<(), ResyncReason> {
        if let Some(violator) = self.spec.violator {
            self.rollback(violator)?;
        }
        while self.spec.srb.front().is_some_and(|entry| entry.may_commit) {
            let Some(entry) = self.spec.srb.pop_front() else {
                break;
            };
            if entry.has_checkpoint {
                self.free_checkpoint(entry.insn);
            }
            if let Some(line) = entry.slat_line {
                self.spec.slat.remove(&(line, entry.insn));
            }
            if let Some(handle) = self.queue.find(entry.insn) {
                self.commit_entry(handle);
            }
            self.stats.committed += 1;
            self.effects.push(Effect::Committed(entry.insn));
            if entry.force_resync {
                return Err(ResyncReason::SideEffectAccess(entry.insn));
            }
        }
        Ok(())
    }

    fn commit_entry(&mut self, handle: EntryHandle) {
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        if entry.is_marker() {
            self.erase_entry(handle);
        } else if entry.segment() == Segment::SpeculativeSend && !entry.is_load() {
            self.queue.move_to(handle, Segment::CommittedSend);
        }
    }

    /// Discard everything from the checkpoint nearest before `violator` onward.
    pub(super) fn rollback(&mut self, violator: InsnId) -> Result<(), ResyncReason> {
        let Some(position) = self.spec.srb.iter().position(|e| e.insn == violator) else {
            return Err(ResyncReason::MissingCheckpoint(violator));
        };

        let mut checkpoint_at = None;
        let mut nearest_discards = 0u64;
        let mut saved_discards = 0u64;
        let mut remaining_checkpoints = 0usize;
        for index in (0..=position).rev() {
            let has_checkpoint = self.spec.srb[index].has_checkpoint;
            if checkpoint_at.is_none() {
                if has_checkpoint {
                    checkpoint_at = Some(index);
                } else {
                    nearest_discards += 1;
                }
            } else {
                saved_discards += 1;
                if has_checkpoint {
                    remaining_checkpoints += 1;
                }
            }
        }
        let Some(checkpoint_at) = checkpoint_at else {
            return Err(ResyncReason::MissingCheckpoint(violator));
        };
        let target = self.spec.srb[checkpoint_at].insn;
        let Some(state) = self.spec.checkpoints.get(&target).map(|c| c.state.clone()) else {
            return Err(ResyncReason::MissingCheckpoint(violator));
        };

        let required = (self.spec.srb.len() as u64).saturating_sub(saved_discards + nearest_discards);
        self.stats.rollbacks += 1;
        self.stats.required_discards += required;
        self.stats.saved_discards += saved_discards;
        self.stats.nearest_checkpoint_discards += nearest_discards;
        self.stats.checkpoints_discarded +=
            self.spec.checkpoints.len().saturating_sub(remaining_checkpoints) as u64;
        info!(
            "cycle {}: rollback to {target} (violator {violator}, required {required}, \
             nearest {nearest_discards}, saved {saved_discards})",
            self.now
        );

        let released = self.clean_mshrs(target);
        self.spec.srb.truncate(checkpoint_at);
        let remaining_ssb = self.clear_speculative(target);
        self.wake(released);

        self.effects.push(Effect::Rollback {
            checkpoint: target,
            state,
        });

        self.spec.slat.retain(|&(_, insn)| insn < target);
        self.spec.checkpoints.retain(|insn, _| *insn < target);
        self.spec.open = self.spec.checkpoints.keys().next_back().copied();
        self.spec.retires_since_checkpoint = 0;
        self.spec.violator = None;
        self.spec.speculating = !self.spec.checkpoints.is_empty();

        if remaining_ssb > 0 {
            self.replay_stalls = (remaining_ssb / self.config.num_memory_ports) as u32;
        }
        Ok(())
    }

    /// Drop miss-tracking waiters that the rollback discards.
    fn clean_mshrs(&mut self, target: InsnId) -> Released {
        let queue = &self.queue;
        self.mshrs.clean(|waiter| match queue.get(waiter) {
            Some(entry) => match entry.segment() {
                Segment::Active => true,
                Segment::SpeculativeSend | Segment::CommittedSend => entry.insn() >= target,
            },
            None => true,
        })
    }

    /// Erase the active segment and every send entry from `target` on, including fence markers
    /// and atomics whose checkpoint was resolved but not yet committed. Returns the number of
    /// speculative send entries that survive.
    fn clear_speculative(&mut self, target: InsnId) -> usize {
        for handle in self.queue.segment_handles(Segment::Active) {
            self.erase_entry(handle);
        }
        for handle in self.queue.segment_handles(Segment::CommittedSend) {
            match self.queue.get(handle) {
                Some(entry) if entry.insn() >= target => {
                    debug!("rollback discards resolved {}", entry.insn());
                    self.erase_entry(handle);
                }
                _ => {}
            }
        }
        let mut remaining = 0;
        for handle in self.queue.segment_handles(Segment::SpeculativeSend) {
            match self.queue.get(handle) {
                Some(entry) if entry.insn() >= target => self.erase_entry(handle),
                Some(_) => remaining += 1,
                None => {}
            }
        }
        remaining
    }

    /// A remote write to `line` is about to become visible.
    pub(super) fn invalidate(&mut self, line: Paddr) {
        if self.spec.speculating {
            let mut violator = None;
            for &(_, insn) in self
                .spec
                .slat
                .range((line, InsnId(0))..=(line, InsnId(u64::MAX)))
            {
                let entry = self.queue.entry(insn);
                let atomic = entry.is_some_and(|e| e.is_atomic());
                if entry.is_some_and(|e| e.is_atomic() && e.speculated_value) {
                    self.stats.slat_hits_atomic_avoided += 1;
                    continue;
                }
                violator = Some((insn, atomic));
                break;
            }
            if let Some((insn, atomic)) = violator {
                if atomic {
                    self.stats.slat_hits_atomic += 1;
                } else {
                    self.stats.slat_hits_load += 1;
                }
                debug!("SLAT hit on {line:#x} by {insn}");
                self.request_abort(insn);
                return;
            }
        }

        let Some(first_incomplete) = self.first_incomplete() else {
            return;
        };
        let last = line + self.config.coherence_unit - 1;
        let mut cursor = None;
        let mut race_counted = false;
        while let Some((key, handle)) = self.queue.next_in_range(cursor, line, last) {
            cursor = Some(key);
            let Some(entry) = self.queue.get(handle) else {
                continue;
            };
            let exposed = entry.is_load()
                && entry.segment() != Segment::CommittedSend
                && entry.status() == Status::Complete
                && !entry.speculated_value;
            if !exposed {
                continue;
            }
            if !race_counted {
                self.stats.races += 1;
                race_counted = true;
            }
            let insn = entry.insn();
            if entry.seq() >= first_incomplete {
                self.do_load(handle);
                if self.queue.get(handle).map(|e| e.status()) != Some(Status::Complete) {
                    self.stats.races_replayed += 1;
                }
            } else {
                self.stats.races_overridden += 1;
                self.effects.push(Effect::OverrideResult(insn));
            }
        }
    }

    /// Sequence number from which completed loads are no longer known to be ordered. `None`
    /// means every completed load is ordered.
    fn first_incomplete(&self) -> Option<u64> {
        if self.spec.speculating {
            return self.queue.front_entry().map(|e| e.seq());
        }
        if self.config.is_sc() && !self.sb_empty() {
            if !self.config.speculative_order {
                return self.queue.front_entry().map(|e| e.seq());
            }
            let head = self
                .queue
                .segment_head(Segment::SpeculativeSend)
                .or_else(|| self.queue.segment_head(Segment::Active))?;
            return self.queue.get(head).map(|e| e.seq());
        }
        let first = self
            .queue
            .segment_handles(Segment::Active)
            .into_iter()
            .filter_map(|h| self.queue.get(h))
            .find(|e| {
                (e.is_load() && !matches!(e.status(), Status::Complete | Status::Annulled))
                    || e.is_marker()
                    || e.is_atomic()
            })
            .map(|e| e.seq());
        Some(first.unwrap_or(0))
    }
}
