//! The physical bus: the single point where every access is checked for size and alignment,
//! then dispatched to RAM or a device window, per §4.3.

use {
    crate::{
        addr::{AccessType, PhysicalAddress, VirtualAddress},
        coherence::{CoherenceBus, CoherenceEvent, CoherenceOp},
        error::{FaultContext, MemoryFault},
        physical::{mmio::MmioRouter, store::PhysicalStore},
    },
    once_cell::sync::OnceCell,
    std::sync::Arc,
};

/// Dispatches physical accesses between backing RAM and registered MMIO windows.
pub struct PhysicalBus {
    store: PhysicalStore,
    mmio: MmioRouter,
    coherence: OnceCell<Arc<CoherenceBus>>,
}

impl PhysicalBus {
    pub fn new(ram_size: usize, mmio: MmioRouter) -> Self {
        Self {
            store: PhysicalStore::new(ram_size),
            mmio,
            coherence: OnceCell::new(),
        }
    }

    /// Wire this bus's coherence publisher. Called once by the builder after the
    /// [`CoherenceBus`] has been constructed from the full subscriber list, which itself may
    /// already hold `Arc<PhysicalBus>` references (breaks the construction cycle between the
    /// two types the same way [`crate::cache::Cache::attach_coherence`] does for caches).
    pub fn attach_coherence(&self, bus: Arc<CoherenceBus>) {
        let _ = self.coherence.set(bus);
    }

    pub fn mmio(&self) -> &MmioRouter {
        &self.mmio
    }

    fn alignment_fault(pa: PhysicalAddress, size: usize, access: AccessType, cpu_id: usize) -> MemoryFault {
        MemoryFault::AlignmentFault {
            ctx: FaultContext::new(VirtualAddress(pa.as_u64()), access, cpu_id, 0).with_physical(pa),
            size,
        }
    }

    fn check_size_and_alignment(
        pa: PhysicalAddress,
        size: usize,
        access: AccessType,
        cpu_id: usize,
        unaligned: bool,
    ) -> Result<(), MemoryFault> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(Self::alignment_fault(pa, size, access, cpu_id));
        }
        if !unaligned && !pa.is_aligned(size as u64) {
            return Err(Self::alignment_fault(pa, size, access, cpu_id));
        }
        Ok(())
    }

    /// Read `size` bytes at `pa`.
    pub fn read(&self, pa: PhysicalAddress, size: usize, cpu_id: usize, unaligned: bool) -> Result<u64, MemoryFault> {
        Self::check_size_and_alignment(pa, size, AccessType::Read, cpu_id, unaligned)?;
        if self.mmio.contains(pa) {
            Ok(self.mmio.read(pa, size, cpu_id))
        } else {
            self.store.read(pa, size, cpu_id)
        }
    }

    /// Write `size` bytes of `value` at `pa`, then broadcast a coherence invalidate for the
    /// affected line so any caching copy elsewhere is dropped.
    pub fn write(&self, pa: PhysicalAddress, size: usize, value: u64, cpu_id: usize, unaligned: bool) -> Result<(), MemoryFault> {
        Self::check_size_and_alignment(pa, size, AccessType::Write, cpu_id, unaligned)?;
        if self.mmio.contains(pa) {
            self.mmio.write(pa, size, value, cpu_id);
        } else {
            self.store.write(pa, size, value, cpu_id)?;
        }
        if let Some(bus) = self.coherence.get() {
            bus.publish(CoherenceEvent {
                line_address: pa.line_address(),
                op: CoherenceOp::Invalidate,
                source_cpu: cpu_id,
            });
        }
        Ok(())
    }

    /// Bulk read, used by cache line fills. Bypasses MMIO: device windows are not cacheable.
    pub fn read_line(&self, line_pa: PhysicalAddress, buf: &mut [u8], cpu_id: usize) -> Result<(), MemoryFault> {
        self.store.read_block(line_pa, buf, cpu_id)
    }

    /// Bulk write-back, used when a cache evicts a dirty line.
    pub fn write_line(&self, line_pa: PhysicalAddress, data: &[u8], cpu_id: usize) -> Result<(), MemoryFault> {
        self.store.write_block(line_pa, data, cpu_id)
    }

    pub fn ram_len(&self) -> usize {
        self.store.len()
    }
}
