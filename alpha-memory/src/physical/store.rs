//! Backing RAM: a byte-addressed linear store with bounds-checked sized access.

use {
    crate::{
        addr::PhysicalAddress,
        error::{FaultContext, MemoryFault},
    },
    std::sync::RwLock,
    tracing::trace,
};

/// Byte-addressed RAM. Reads take a shared guard; writes take an exclusive guard for the
/// minimum critical section (a single word or a line-sized block copy), per §5's resource
/// policy for `PhysicalStore`.
pub struct PhysicalStore {
    bytes: RwLock<Vec<u8>>,
}

impl PhysicalStore {
    /// Allocate `len` zeroed bytes of backing RAM.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; len]),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn out_of_range(pa: PhysicalAddress, cpu_id: usize) -> MemoryFault {
        MemoryFault::AccessViolation {
            ctx: FaultContext::new(crate::addr::VirtualAddress(pa.as_u64()), crate::addr::AccessType::Read, cpu_id, 0)
                .with_physical(pa),
        }
    }

    /// Read `size` bytes (1, 2, 4 or 8) at `pa` as a little-endian integer.
    pub fn read(&self, pa: PhysicalAddress, size: usize, cpu_id: usize) -> Result<u64, MemoryFault> {
        let bytes = self.bytes.read().unwrap();
        let start = pa.as_u64() as usize;
        let end = start.checked_add(size).ok_or_else(|| Self::out_of_range(pa, cpu_id))?;
        if end > bytes.len() {
            return Err(Self::out_of_range(pa, cpu_id));
        }
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[start..end]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write `size` bytes (1, 2, 4 or 8) of `value` at `pa`, little-endian.
    pub fn write(&self, pa: PhysicalAddress, size: usize, value: u64, cpu_id: usize) -> Result<(), MemoryFault> {
        let mut bytes = self.bytes.write().unwrap();
        let start = pa.as_u64() as usize;
        let end = start.checked_add(size).ok_or_else(|| Self::out_of_range(pa, cpu_id))?;
        if end > bytes.len() {
            return Err(Self::out_of_range(pa, cpu_id));
        }
        let le = value.to_le_bytes();
        bytes[start..end].copy_from_slice(&le[..size]);
        trace!(pa = ?pa, size, "physical store write");
        Ok(())
    }

    /// Bulk read into `buf`.
    pub fn read_block(&self, pa: PhysicalAddress, buf: &mut [u8], cpu_id: usize) -> Result<(), MemoryFault> {
        let bytes = self.bytes.read().unwrap();
        let start = pa.as_u64() as usize;
        let end = start.checked_add(buf.len()).ok_or_else(|| Self::out_of_range(pa, cpu_id))?;
        if end > bytes.len() {
            return Err(Self::out_of_range(pa, cpu_id));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    /// Bulk write from `data`.
    pub fn write_block(&self, pa: PhysicalAddress, data: &[u8], cpu_id: usize) -> Result<(), MemoryFault> {
        let mut bytes = self.bytes.write().unwrap();
        let start = pa.as_u64() as usize;
        let end = start.checked_add(data.len()).ok_or_else(|| Self::out_of_range(pa, cpu_id))?;
        if end > bytes.len() {
            return Err(Self::out_of_range(pa, cpu_id));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Grow or shrink the backing store. Shrinking drops trailing bytes.
    pub fn resize(&self, new_len: usize) {
        self.bytes.write().unwrap().resize(new_len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_write_then_read() {
        let store = PhysicalStore::new(16 * 1024 * 1024);
        store.write(PhysicalAddress::new(0x1_0000), 8, 0xDEAD_BEEF_CAFE_BABE, 0).unwrap();
        let value = store.read(PhysicalAddress::new(0x1_0000), 8, 0).unwrap();
        assert_eq!(value, 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn block_round_trip() {
        let store = PhysicalStore::new(4096);
        let data: Vec<u8> = (0..64).collect();
        store.write_block(PhysicalAddress::new(0x100), &data, 0).unwrap();
        let mut out = vec![0u8; 64];
        store.read_block(PhysicalAddress::new(0x100), &mut out, 0).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let store = PhysicalStore::new(16);
        assert!(matches!(
            store.read(PhysicalAddress::new(10), 8, 0),
            Err(MemoryFault::AccessViolation { .. })
        ));
    }
}
