use log::trace;

use super::queue::EntryHandle;
use super::types::{align8, Paddr, Status};
use super::MemUnit;

/// Bytes touched by `[paddr, paddr + size)`, relative to the containing 8-byte aligned address.
/// Accesses may spill past the aligned doubleword, hence 16 bits.
pub(super) fn byte_mask(paddr: Paddr, size: u8) -> u16 {
    let offset = (paddr - align8(paddr)) as u32;
    let bytes = (1u32 << size as u32) - 1;
    (bytes << offset) as u16
}

pub(super) fn covers(store: u16, load: u16) -> bool {
    store & load == load
}

pub(super) fn intersects(store: u16, load: u16) -> bool {
    store & load != 0
}

/// Little-endian scratch image of the 16 bytes starting at an aligned address.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct ByteWindow {
    bytes: u128,
}

impl ByteWindow {
    fn lane(paddr: Paddr, size: u8) -> (u32, u128) {
        let shift = ((paddr - align8(paddr)) * 8) as u32;
        let width = if size >= 16 {
            u128::MAX
        } else {
            (1u128 << (size as u32 * 8)) - 1
        };
        (shift, width)
    }

    pub fn place(&mut self, paddr: Paddr, size: u8, value: u64) {
        let (shift, width) = Self::lane(paddr, size);
        self.bytes = (self.bytes & !(width << shift)) | (((value as u128) & width) << shift);
    }

    pub fn read(&self, paddr: Paddr, size: u8) -> u64 {
        let (shift, width) = Self::lane(paddr, size);
        ((self.bytes >> shift) & width) as u64
    }
}

impl MemUnit {
    fn mask_of(&self, handle: EntryHandle) -> Option<u16> {
        let entry = self.queue.get(handle)?;
        entry
            .paddr()
            .resolved()
            .map(|paddr| byte_mask(paddr, entry.size()))
    }

    /// Copy what the youngest older intersecting store knows into `load`.
    fn forward_value(&mut self, store: EntryHandle, load: EntryHandle) {
        let (Some(store_mask), Some(load_mask)) = (self.mask_of(store), self.mask_of(load)) else {
            return;
        };
        let Some(source) = self.queue.get(store) else {
            return;
        };
        let (store_paddr, store_size, store_value) = (
            source.paddr().resolved().unwrap_or_default(),
            source.size(),
            source.value,
        );
        let Some(entry) = self.queue.get_mut(load) else {
            return;
        };

        if covers(store_mask, load_mask) {
            let forwarded = if entry.size() == store_size {
                store_value
            } else {
                store_value.map(|value| {
                    let mut window = ByteWindow::default();
                    window.place(store_paddr, store_size, value);
                    window.read(entry.paddr().resolved().unwrap_or_default(), entry.size())
                })
            };
            entry.set_load_value(forwarded);
            if entry.partial_snoop {
                entry.partial_snoop = false;
                self.partial_snoops -= 1;
            }
            if forwarded.is_some() {
                self.stats.forwarded_loads += 1;
            }
        } else {
            entry.set_load_value(None);
            if !entry.partial_snoop {
                entry.partial_snoop = true;
                self.partial_snoops += 1;
                self.stats.partial_snoop_loads += 1;
            }
        }
    }

    /// Search older same-address stores, youngest first. The first non-annulled store that
    /// intersects the load decides its value; without one the load goes to memory.
    pub(super) fn snoop_stores(&mut self, load: EntryHandle) {
        let Some(load_mask) = self.mask_of(load) else {
            return;
        };
        if let Some(entry) = self.queue.get_mut(load) {
            entry.set_load_value(None);
        }
        let older = self.queue.older_same_address(load);
        for store in older.into_iter().rev() {
            let Some(candidate) = self.queue.get(store) else {
                continue;
            };
            if !candidate.is_store() || candidate.annulled {
                continue;
            }
            if !self.mask_of(store).is_some_and(|mask| intersects(mask, load_mask)) {
                continue;
            }
            trace!(
                "{} snoops {}",
                self.queue.get(load).map(|e| e.insn()).unwrap_or_default(),
                candidate.insn()
            );
            self.forward_value(store, load);
            self.compose_partial(load);
            return;
        }
    }

    /// Complete a partially overlapped load when every one of its bytes is owned by an older
    /// store whose value is known.
    fn compose_partial(&mut self, load: EntryHandle) -> bool {
        let Some(entry) = self.queue.get(load) else {
            return false;
        };
        if entry.is_atomic() || !entry.partial_snoop {
            return false;
        }
        let Some(load_paddr) = entry.paddr().resolved() else {
            return false;
        };
        let load_size = entry.size();
        let mut undecided = byte_mask(load_paddr, load_size);
        let mut owners = Vec::new();
        for store in self.queue.older_same_address(load).into_iter().rev() {
            let Some(candidate) = self.queue.get(store) else {
                continue;
            };
            if !candidate.is_store() || candidate.annulled {
                continue;
            }
            let Some(paddr) = candidate.paddr().resolved() else {
                continue;
            };
            let mask = byte_mask(paddr, candidate.size());
            if mask & undecided == 0 {
                continue;
            }
            let Some(value) = candidate.value else {
                return false;
            };
            owners.push((paddr, candidate.size(), value));
            undecided &= !mask;
            if undecided == 0 {
                break;
            }
        }
        if undecided != 0 {
            return false;
        }

        let mut window = ByteWindow::default();
        for (paddr, size, value) in owners.into_iter().rev() {
            window.place(paddr, size, value);
        }
        let Some(entry) = self.queue.get_mut(load) else {
            return false;
        };
        entry.set_load_value(Some(window.read(load_paddr, load_size)));
        entry.partial_snoop = false;
        self.partial_snoops -= 1;
        self.stats.composed_loads += 1;
        true
    }

    /// Fold every older known-valued store, oldest first, over the value memory returned.
    pub(super) fn apply_all_stores(&mut self, load: EntryHandle) {
        let Some(entry) = self.queue.get(load) else {
            return;
        };
        let (Some(load_paddr), Some(base)) = (entry.paddr().resolved(), entry.load_value()) else {
            return;
        };
        let load_size = entry.size();
        let load_mask = byte_mask(load_paddr, load_size);
        let mut window = ByteWindow::default();
        window.place(load_paddr, load_size, base);
        for store in self.queue.older_same_address(load) {
            let Some(candidate) = self.queue.get(store) else {
                continue;
            };
            if !candidate.is_store() || candidate.annulled {
                continue;
            }
            let (Some(paddr), Some(value)) = (candidate.paddr().resolved(), candidate.value) else {
                continue;
            };
            if intersects(byte_mask(paddr, candidate.size()), load_mask) {
                window.place(paddr, candidate.size(), value);
            }
        }
        if let Some(entry) = self.queue.get_mut(load) {
            entry.set_load_value(Some(window.read(load_paddr, load_size)));
        }
    }

    /// (Re)compute a load's value from the store queue and, when nothing older can supply it,
    /// send it to memory.
    pub(super) fn do_load(&mut self, load: EntryHandle) {
        let Some(entry) = self.queue.get_mut(load) else {
            return;
        };
        debug_assert!(entry.is_load());
        let insn = entry.insn();
        let atomic = entry.is_atomic();

        if atomic && entry.partial_snoop {
            // partially overlapped atomics wait to issue from the head of the active segment
            let had_value = entry.load_value().is_some();
            entry.set_load_value(None);
            entry.issued = false;
            if had_value {
                self.squash(insn);
            }
            return;
        }

        let mut previous = None;
        match entry.status() {
            Status::AwaitingValue | Status::Complete => {
                previous = entry.load_value();
                entry.issued = false;
            }
            Status::Annulled => {
                entry.issued = false;
                return;
            }
            Status::IssuedToMemory => self.break_mshr_link(load),
            Status::AwaitingPort | Status::AwaitingIssue => {
                if atomic {
                    previous = entry.load_value();
                    entry.issued = false;
                }
            }
            Status::AwaitingAddress => return,
        }

        let Some(entry) = self.queue.get_mut(load) else {
            return;
        };
        if entry.is_abnormal() {
            entry.issued = false;
            if previous.is_some() {
                self.squash(insn);
            }
            return;
        }
        if atomic && !self.config.speculative_order {
            return;
        }

        self.snoop_stores(load);

        let Some(entry) = self.queue.get_mut(load) else {
            return;
        };
        if atomic && entry.partial_snoop {
            return;
        }
        let current = entry.load_value();
        match entry.status() {
            Status::Complete | Status::AwaitingValue => {
                if previous != current {
                    entry.issued = false;
                    if previous.is_some() {
                        self.squash(insn);
                    }
                    if current.is_some() {
                        self.satisfy(insn);
                    }
                }
            }
            Status::AwaitingIssue => {
                if previous.is_some() {
                    self.squash(insn);
                }
                self.request_port(load);
            }
            Status::AwaitingPort => {
                if previous.is_some() {
                    self.squash(insn);
                }
            }
            status => debug_assert!(false, "{insn} left in {status:?} after snooping"),
        }
    }

    pub(super) fn do_store(&mut self, store: EntryHandle) {
        self.update_dependant_loads(store);
    }

    /// Re-snoop younger loads that overlap `store`, stopping at the next store that shadows all
    /// of its bytes. A younger store that covers only part of it leaves later loads composing
    /// bytes from both.
    pub(super) fn update_dependant_loads(&mut self, store: EntryHandle) {
        let Some(entry) = self.queue.get(store) else {
            return;
        };
        let (Some(aligned), Some(store_mask)) = (entry.aligned(), self.mask_of(store)) else {
            return;
        };
        let mut cursor = entry.seq();
        while let Some((seq, next)) = self.queue.next_same_address(aligned, cursor) {
            cursor = seq;
            let Some(mask) = self.mask_of(next) else {
                continue;
            };
            if !intersects(store_mask, mask) {
                continue;
            }
            let Some(candidate) = self.queue.get(next) else {
                continue;
            };
            if candidate.is_load() {
                self.do_load(next);
            } else if candidate.is_store() && !candidate.annulled && covers(mask, store_mask) {
                break;
            }
        }
    }

    /// Re-snoop dependants as if `store` were gone; used when its address or value is withdrawn.
    pub(super) fn resnoop_dependant_loads(&mut self, store: EntryHandle) {
        let Some(entry) = self.queue.get_mut(store) else {
            return;
        };
        if entry.paddr().resolved().is_none() {
            return;
        }
        let was_annulled = entry.annulled;
        entry.annulled = true;
        self.update_dependant_loads(store);
        if let Some(entry) = self.queue.get_mut(store) {
            entry.annulled = was_annulled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_are_relative_to_the_aligned_doubleword() {
        assert_eq!(byte_mask(0x100, 8), 0x00ff);
        assert_eq!(byte_mask(0x102, 4), 0x003c);
        assert_eq!(byte_mask(0x107, 8), 0x7f80);
        assert!(covers(byte_mask(0x100, 8), byte_mask(0x104, 2)));
        assert!(!covers(byte_mask(0x100, 4), byte_mask(0x102, 4)));
        assert!(intersects(byte_mask(0x100, 4), byte_mask(0x102, 4)));
        assert!(!intersects(byte_mask(0x100, 2), byte_mask(0x104, 4)));
    }

    #[test]
    fn window_extracts_little_endian_bytes() {
        let mut window = ByteWindow::default();
        window.place(0x100, 8, 0x8877_6655_4433_2211);
        assert_eq!(window.read(0x102, 2), 0x4433);
        window.place(0x103, 1, 0xee);
        assert_eq!(window.read(0x100, 4), 0xee33_2211);
        assert_eq!(window.read(0x104, 4), 0x8877_6655);
    }
}
