use anyhow::bail;

use crate::memunit::Paddr;

/// Byte-addressed backing store behind the simulated memory system. Multi-byte accesses are
/// little-endian and may be unaligned.
pub trait HasMemory {
    fn read_impl(&self, addr: Paddr, buf: &mut [u8]) -> Result<(), anyhow::Error>;
    fn write_impl(&mut self, addr: Paddr, data: &[u8]) -> Result<(), anyhow::Error>;

    fn read(&self, addr: Paddr, size: u8) -> Result<u64, anyhow::Error> {
        check_access(addr, size)?;
        let mut buf = [0u8; 8];
        self.read_impl(addr, &mut buf[..size as usize])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&mut self, addr: Paddr, size: u8, value: u64) -> Result<(), anyhow::Error> {
        check_access(addr, size)?;
        let bytes = value.to_le_bytes();
        self.write_impl(addr, &bytes[..size as usize])
    }
}

fn check_access(addr: Paddr, size: u8) -> Result<(), anyhow::Error> {
    if !matches!(size, 1 | 2 | 4 | 8) {
        bail!("unsupported access size {} @ {:#x}", size, addr);
    }
    if addr.checked_add(size as u64 - 1).is_none() {
        bail!("access of size {} @ {:#x} wraps the address space", size, addr);
    }
    Ok(())
}
