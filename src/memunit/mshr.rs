use smallvec::SmallVec;
use std::collections::BTreeMap;

use super::message::{MessageKind, TransactionTracker};
use super::queue::EntryHandle;
use super::types::{InsnId, Paddr};

#[derive(Debug)]
pub struct MshrEntry {
    pub paddr: Paddr,
    pub op: MessageKind,
    pub size: u8,
    pub waiting: SmallVec<[EntryHandle; 2]>,
    pub blocked_ops: SmallVec<[InsnId; 2]>,
    pub blocked_prefetches: SmallVec<[InsnId; 2]>,
    pub tracker: TransactionTracker,
}

impl MshrEntry {
    pub fn new(paddr: Paddr, op: MessageKind, size: u8, tracker: TransactionTracker) -> Self {
        Self {
            paddr,
            op,
            size,
            waiting: SmallVec::new(),
            blocked_ops: SmallVec::new(),
            blocked_prefetches: SmallVec::new(),
            tracker,
        }
    }
}

/// Work released when an entry leaves the table without a matching reply.
#[derive(Debug, Default)]
pub struct Released {
    pub blocked_ops: SmallVec<[InsnId; 2]>,
    pub blocked_prefetches: SmallVec<[InsnId; 2]>,
}

impl Released {
    fn absorb(&mut self, mut entry: MshrEntry) {
        entry.tracker.wrong_path = true;
        self.blocked_ops.extend(entry.blocked_ops);
        self.blocked_prefetches.extend(entry.blocked_prefetches);
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_ops.is_empty() && self.blocked_prefetches.is_empty()
    }
}

/// Outstanding requests keyed by physical address. The table holds at most one entry per
/// address; a second access to the address either rides along or waits.
#[derive(Debug, Default)]
pub struct MshrTable {
    entries: BTreeMap<Paddr, MshrEntry>,
}

impl MshrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_entry(&self, paddr: Paddr) -> bool {
        self.entries.contains_key(&paddr)
    }

    pub fn get(&self, paddr: Paddr) -> Option<&MshrEntry> {
        self.entries.get(&paddr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach a load to an outstanding load of the same size.
    pub fn scan_and_attach(&mut self, paddr: Paddr, size: u8, waiter: EntryHandle) -> bool {
        match self.entries.get_mut(&paddr) {
            Some(entry) if entry.op == MessageKind::LoadRequest && entry.size == size => {
                entry.waiting.push(waiter);
                true
            }
            _ => false,
        }
    }

    /// Park `insn` behind whatever is outstanding at `paddr`.
    pub fn scan_and_block(&mut self, paddr: Paddr, insn: InsnId) -> bool {
        match self.entries.get_mut(&paddr) {
            Some(entry) => {
                entry.blocked_ops.push(insn);
                true
            }
            None => false,
        }
    }

    pub fn scan_and_block_prefetch(&mut self, paddr: Paddr, insn: InsnId) -> bool {
        match self.entries.get_mut(&paddr) {
            Some(entry) => {
                entry.blocked_prefetches.push(insn);
                true
            }
            None => false,
        }
    }

    pub fn allocate(&mut self, entry: MshrEntry) {
        assert!(
            !self.entries.contains_key(&entry.paddr),
            "second miss-tracking entry for {:#x}",
            entry.paddr
        );
        self.entries.insert(entry.paddr, entry);
    }

    /// Removes the entry to deliver a reply to its waiters.
    pub fn remove(&mut self, paddr: Paddr) -> Option<MshrEntry> {
        self.entries.remove(&paddr)
    }

    /// Drops one waiter. If that empties the entry it is retired as wrong-path and its blocked
    /// work is handed back to the caller.
    pub fn detach(&mut self, paddr: Paddr, waiter: EntryHandle) -> Option<Released> {
        let entry = self.entries.get_mut(&paddr)?;
        if let Some(pos) = entry.waiting.iter().position(|h| *h == waiter) {
            entry.waiting.remove(pos);
        }
        if !entry.waiting.is_empty() {
            return None;
        }
        let entry = self.entries.remove(&paddr)?;
        let mut released = Released::default();
        released.absorb(entry);
        Some(released)
    }

    /// Drops every waiter matching `discard`; entries left without waiters are retired like in
    /// `detach`.
    pub fn clean<F>(&mut self, mut discard: F) -> Released
    where
        F: FnMut(EntryHandle) -> bool,
    {
        let mut released = Released::default();
        let mut emptied = Vec::new();
        for (paddr, entry) in self.entries.iter_mut() {
            entry.waiting.retain(|h| !discard(*h));
            if entry.waiting.is_empty() {
                emptied.push(*paddr);
            }
        }
        for paddr in emptied {
            if let Some(entry) = self.entries.remove(&paddr) {
                released.absorb(entry);
            }
        }
        released
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memunit::queue::MemQueue;
    use crate::memunit::types::MemOpKind;

    fn tracker(paddr: Paddr) -> TransactionTracker {
        TransactionTracker::new(1, paddr, None, 0)
    }

    #[test]
    fn loads_of_equal_size_share_an_entry() {
        let mut queue = MemQueue::new();
        let first = queue.insert(InsnId(1), MemOpKind::Load, 8, false).unwrap();
        let second = queue.insert(InsnId(2), MemOpKind::Load, 8, false).unwrap();
        let narrow = queue.insert(InsnId(3), MemOpKind::Load, 4, false).unwrap();

        let mut table = MshrTable::new();
        let mut entry = MshrEntry::new(0x40, MessageKind::LoadRequest, 8, tracker(0x40));
        entry.waiting.push(first);
        table.allocate(entry);

        assert!(table.scan_and_attach(0x40, 8, second));
        assert!(!table.scan_and_attach(0x40, 4, narrow));
        assert!(table.scan_and_block(0x40, InsnId(3)));
        assert!(!table.scan_and_block(0x80, InsnId(3)));
        assert_eq!(table.len(), 1);

        let entry = table.remove(0x40).unwrap();
        assert_eq!(entry.waiting.as_slice(), &[first, second]);
        assert_eq!(entry.blocked_ops.as_slice(), &[InsnId(3)]);
    }

    #[test]
    fn stores_never_accept_riders() {
        let mut queue = MemQueue::new();
        let store = queue.insert(InsnId(1), MemOpKind::Store, 8, false).unwrap();
        let load = queue.insert(InsnId(2), MemOpKind::Load, 8, false).unwrap();
        let mut table = MshrTable::new();
        let mut entry = MshrEntry::new(0x40, MessageKind::StoreRequest, 8, tracker(0x40));
        entry.waiting.push(store);
        table.allocate(entry);
        assert!(!table.scan_and_attach(0x40, 8, load));
    }

    #[test]
    fn last_detach_releases_blocked_work() {
        let mut queue = MemQueue::new();
        let a = queue.insert(InsnId(1), MemOpKind::Load, 8, false).unwrap();
        let b = queue.insert(InsnId(2), MemOpKind::Load, 8, false).unwrap();
        let mut table = MshrTable::new();
        let mut entry = MshrEntry::new(0x40, MessageKind::LoadRequest, 8, tracker(0x40));
        entry.waiting.push(a);
        entry.waiting.push(b);
        table.allocate(entry);
        table.scan_and_block(0x40, InsnId(5));
        table.scan_and_block_prefetch(0x40, InsnId(6));

        assert!(table.detach(0x40, a).is_none());
        let released = table.detach(0x40, b).expect("entry emptied");
        assert_eq!(released.blocked_ops.as_slice(), &[InsnId(5)]);
        assert_eq!(released.blocked_prefetches.as_slice(), &[InsnId(6)]);
        assert!(!table.has_entry(0x40));
    }

    #[test]
    fn clean_drops_matching_waiters_only() {
        let mut queue = MemQueue::new();
        let keep = queue.insert(InsnId(1), MemOpKind::Load, 8, false).unwrap();
        let drop_a = queue.insert(InsnId(2), MemOpKind::Load, 8, false).unwrap();
        let drop_b = queue.insert(InsnId(3), MemOpKind::Load, 8, false).unwrap();
        let mut table = MshrTable::new();
        let mut shared = MshrEntry::new(0x40, MessageKind::LoadRequest, 8, tracker(0x40));
        shared.waiting.push(keep);
        shared.waiting.push(drop_a);
        table.allocate(shared);
        let mut lone = MshrEntry::new(0x80, MessageKind::LoadRequest, 8, tracker(0x80));
        lone.waiting.push(drop_b);
        lone.blocked_ops.push(InsnId(9));
        table.allocate(lone);

        let released = table.clean(|h| h == drop_a || h == drop_b);
        assert!(table.has_entry(0x40));
        assert!(!table.has_entry(0x80));
        assert_eq!(released.blocked_ops.as_slice(), &[InsnId(9)]);
    }

    #[test]
    fn misses_within_one_doubleword_are_tracked_apart() {
        let mut queue = MemQueue::new();
        let low = queue.insert(InsnId(1), MemOpKind::Load, 4, false).unwrap();
        let high = queue.insert(InsnId(2), MemOpKind::Load, 4, false).unwrap();
        let mut table = MshrTable::new();
        let mut entry = MshrEntry::new(0x40, MessageKind::LoadRequest, 4, tracker(0x40));
        entry.waiting.push(low);
        table.allocate(entry);

        // same aligned address, different offset: no ride-along, no blocking
        assert!(!table.scan_and_attach(0x44, 4, high));
        assert!(!table.scan_and_block(0x44, InsnId(2)));
        let mut entry = MshrEntry::new(0x44, MessageKind::LoadRequest, 4, tracker(0x44));
        entry.waiting.push(high);
        table.allocate(entry);
        assert_eq!(table.len(), 2);

        assert_eq!(table.remove(0x44).map(|e| e.waiting.into_vec()), Some(vec![high]));
        assert!(table.has_entry(0x40));
    }

    #[test]
    #[should_panic]
    fn second_entry_for_an_address_panics() {
        let mut table = MshrTable::new();
        table.allocate(MshrEntry::new(0x40, MessageKind::LoadRequest, 8, tracker(0x40)));
        table.allocate(MshrEntry::new(0x40, MessageKind::StoreRequest, 8, tracker(0x40)));
    }
}
