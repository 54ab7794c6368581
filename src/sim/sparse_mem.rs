use std::collections::HashMap;

use crate::base::mem::HasMemory;
use crate::memunit::Paddr;

const PAGE_BITS: u64 = 12;
const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Page-granular sparse memory; untouched bytes read as zero.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE]>>,
}

impl HasMemory for SparseMemory {
    fn read_impl(&self, addr: Paddr, buf: &mut [u8]) -> Result<(), anyhow::Error> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = addr + i as u64;
            *byte = self
                .pages
                .get(&(addr >> PAGE_BITS))
                .map(|page| page[offset(addr)])
                .unwrap_or(0);
        }
        Ok(())
    }

    fn write_impl(&mut self, addr: Paddr, data: &[u8]) -> Result<(), anyhow::Error> {
        for (i, byte) in data.iter().enumerate() {
            let addr = addr + i as u64;
            let page = self
                .pages
                .entry(addr >> PAGE_BITS)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[offset(addr)] = *byte;
        }
        Ok(())
    }
}

fn offset(addr: Paddr) -> usize {
    (addr as usize) & (PAGE_SIZE - 1)
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_memory_reads_zero() {
        let mem = SparseMemory::new();
        assert_eq!(mem.read(0xdead_0000, 8).unwrap(), 0);
        assert_eq!(mem.resident_pages(), 0);
    }

    #[test]
    fn writes_are_little_endian_and_may_straddle_pages() {
        let mut mem = SparseMemory::new();
        mem.write(0x0ffe, 4, 0x4433_2211).unwrap();
        assert_eq!(mem.read(0x0ffe, 2).unwrap(), 0x2211);
        assert_eq!(mem.read(0x1000, 2).unwrap(), 0x4433);
        assert_eq!(mem.resident_pages(), 2);
    }

    #[test]
    fn odd_sizes_are_rejected() {
        let mut mem = SparseMemory::new();
        assert!(mem.write(0x10, 3, 0).is_err());
        assert!(mem.read(u64::MAX, 2).is_err());
    }
}
