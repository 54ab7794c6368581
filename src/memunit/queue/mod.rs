//! Ordered ledger of in-flight memory operations.
//!
//! Entries live in a slot arena and are referenced through generation-checked handles. Four
//! ordered views sit on top of the arena: by sequence, by owning instruction, by 8-byte aligned
//! physical address (then sequence), and by (segment, sequence). Every structural change goes
//! through this type so the views never disagree.

mod entry;

pub use entry::MemQueueEntry;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Included, Unbounded};

use super::error::MemUnitError;
use super::types::{align8, InsnId, MemOpKind, Paddr, PhysAddr, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<MemQueueEntry>,
}

#[derive(Debug, Default)]
pub struct MemQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u64,
    by_seq: BTreeMap<u64, EntryHandle>,
    by_insn: HashMap<InsnId, EntryHandle>,
    by_addr: BTreeMap<(Paddr, u64), EntryHandle>,
    by_segment: BTreeMap<(Segment, u64), EntryHandle>,
    lsq_count: usize,
    sb_count: usize,
    sbnaw_count: usize,
}

impl MemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        insn: InsnId,
        op: MemOpKind,
        size: u8,
        bypass_sb: bool,
    ) -> Result<EntryHandle, MemUnitError> {
        if self.by_insn.contains_key(&insn) {
            return Err(MemUnitError::DuplicateInstruction(insn));
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let entry = MemQueueEntry::new(insn, seq, op, size, bypass_sb);

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                EntryHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                EntryHandle {
                    index,
                    generation: 0,
                }
            }
        };

        self.by_seq.insert(seq, handle);
        self.by_insn.insert(insn, handle);
        self.by_segment.insert((Segment::Active, seq), handle);
        self.lsq_count += 1;
        Ok(handle)
    }

    pub fn find(&self, insn: InsnId) -> Option<EntryHandle> {
        self.by_insn.get(&insn).copied()
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&MemQueueEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut MemQueueEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn entry(&self, insn: InsnId) -> Option<&MemQueueEntry> {
        self.find(insn).and_then(|handle| self.get(handle))
    }

    pub fn contains(&self, handle: EntryHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Removes the entry and invalidates every outstanding handle to it.
    pub fn erase(&mut self, handle: EntryHandle) -> Option<MemQueueEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        self.by_seq.remove(&entry.seq());
        self.by_insn.remove(&entry.insn());
        self.by_segment.remove(&(entry.segment(), entry.seq()));
        if let Some(aligned) = entry.aligned() {
            self.by_addr.remove(&(aligned, entry.seq()));
        }
        self.uncount(entry.segment(), entry.bypass_sb());
        Some(entry)
    }

    pub fn set_paddr(&mut self, handle: EntryHandle, paddr: PhysAddr) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        let seq = entry.seq();
        let old = entry.aligned();
        entry.set_paddr(paddr);
        let new = entry.aligned();
        if let Some(aligned) = old {
            self.by_addr.remove(&(aligned, seq));
        }
        if let Some(aligned) = new {
            self.by_addr.insert((aligned, seq), handle);
        }
    }

    pub fn move_to(&mut self, handle: EntryHandle, segment: Segment) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        let old = entry.segment();
        if old == segment {
            return;
        }
        let seq = entry.seq();
        let bypass = entry.bypass_sb();
        entry.set_segment(segment);
        self.by_segment.remove(&(old, seq));
        self.by_segment.insert((segment, seq), handle);
        self.uncount(old, bypass);
        self.count(segment, bypass);
    }

    pub fn set_bypass(&mut self, handle: EntryHandle, bypass: bool) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        let old = entry.bypass_sb();
        if old == bypass {
            return;
        }
        let segment = entry.segment();
        entry.set_bypass_sb(bypass);
        self.uncount(segment, old);
        self.count(segment, bypass);
    }

    fn count(&mut self, segment: Segment, bypass: bool) {
        match segment {
            Segment::Active => self.lsq_count += 1,
            _ if bypass => self.sbnaw_count += 1,
            _ => self.sb_count += 1,
        }
    }

    fn uncount(&mut self, segment: Segment, bypass: bool) {
        match segment {
            Segment::Active => self.lsq_count -= 1,
            _ if bypass => self.sbnaw_count -= 1,
            _ => self.sb_count -= 1,
        }
    }

    /// Oldest entry overall.
    pub fn front(&self) -> Option<EntryHandle> {
        self.by_seq.values().next().copied()
    }

    pub fn front_entry(&self) -> Option<&MemQueueEntry> {
        self.front().and_then(|handle| self.get(handle))
    }

    pub fn segment_head(&self, segment: Segment) -> Option<EntryHandle> {
        self.by_segment
            .range((segment, 0)..=(segment, u64::MAX))
            .next()
            .map(|(_, handle)| *handle)
    }

    pub fn segment_handles(&self, segment: Segment) -> Vec<EntryHandle> {
        self.by_segment
            .range((segment, 0)..=(segment, u64::MAX))
            .map(|(_, handle)| *handle)
            .collect()
    }

    /// All handles in sequence order.
    pub fn handles(&self) -> Vec<EntryHandle> {
        self.by_seq.values().copied().collect()
    }

    /// Entry immediately older than `handle` in sequence order.
    pub fn predecessor(&self, handle: EntryHandle) -> Option<EntryHandle> {
        let seq = self.get(handle)?.seq();
        self.by_seq
            .range(..seq)
            .next_back()
            .map(|(_, handle)| *handle)
    }

    /// Older entries sharing `handle`'s aligned address, oldest first.
    pub fn older_same_address(&self, handle: EntryHandle) -> Vec<EntryHandle> {
        let Some(entry) = self.get(handle) else {
            return Vec::new();
        };
        let Some(aligned) = entry.aligned() else {
            return Vec::new();
        };
        self.by_addr
            .range((aligned, 0)..(aligned, entry.seq()))
            .map(|(_, handle)| *handle)
            .collect()
    }

    /// First entry at `aligned` with a sequence number above `seq`.
    pub fn next_same_address(&self, aligned: Paddr, seq: u64) -> Option<(u64, EntryHandle)> {
        self.by_addr
            .range((Excluded((aligned, seq)), Included((aligned, u64::MAX))))
            .next()
            .map(|((_, seq), handle)| (*seq, *handle))
    }

    /// First entry (by aligned address, then sequence) in `[from, to]`, where `from` is an
    /// exclusive `(aligned, seq)` cursor when given.
    pub fn next_in_range(
        &self,
        cursor: Option<(Paddr, u64)>,
        from: Paddr,
        to: Paddr,
    ) -> Option<((Paddr, u64), EntryHandle)> {
        let lower = match cursor {
            Some(key) => Excluded(key),
            None => Included((align8(from), 0)),
        };
        self.by_addr
            .range((lower, Unbounded))
            .next()
            .filter(|((aligned, _), _)| *aligned <= to)
            .map(|(key, handle)| (*key, *handle))
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    pub fn lsq_count(&self) -> usize {
        self.lsq_count
    }

    /// Non-bypassing entries in either send segment.
    pub fn sb_count(&self) -> usize {
        self.sb_count
    }

    /// Bypassing (non-allocating) entries in either send segment.
    pub fn sbnaw_count(&self) -> usize {
        self.sbnaw_count
    }

    pub fn clear(&mut self) {
        for handle in self.handles() {
            self.erase(handle);
        }
        debug_assert_eq!(self.lsq_count + self.sb_count + self.sbnaw_count, 0);
    }
}
