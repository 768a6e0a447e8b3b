//! Three-level page-table walker, per §4.6.

use {
    crate::{
        addr::{AccessType, Asn, Granularity, Mode, PhysicalAddress, VirtualAddress},
        error::{FaultContext, MemoryFault},
        physical::PhysicalBus,
        pte::PageTableEntry,
        stats::Counter,
    },
    tracing::trace,
};

/// A resolved translation, as returned to the TLB for insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub pa: PhysicalAddress,
    pub granularity: Granularity,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Leaf PTE's `asm_bit`: this translation matches any ASN, not just the one it was walked
    /// under, so the TLB should insert it as a global entry.
    pub global: bool,
}

/// Walks the three-level page table rooted at a page-table base register (PTBR), reading PTEs
/// off the physical bus.
#[derive(Default)]
pub struct PageTableWalker {
    pub walks: Counter,
}

impl PageTableWalker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_entry(&self, bus: &PhysicalBus, table_base: PhysicalAddress, index: usize, cpu_id: usize) -> Result<PageTableEntry, MemoryFault> {
        let entry_addr = table_base
            .checked_add((index as u64) * 8)
            .expect("page table index within a 8-entry-per-8-bytes table cannot overflow a 64-bit address");
        let raw = bus.read(entry_addr, 8, cpu_id, true)?;
        Ok(PageTableEntry::from_raw(raw))
    }

    fn fault(&self, va: VirtualAddress, access: AccessType, cpu_id: usize, kind: WalkFaultKind) -> MemoryFault {
        let ctx = FaultContext::new(va, access, cpu_id, 0);
        match kind {
            WalkFaultKind::Missing => MemoryFault::PageFault { ctx },
            WalkFaultKind::Protection => MemoryFault::ProtectionFault { ctx },
        }
    }

    /// Walk `va` to a physical translation. `ptbr` is the page-table base register supplied by
    /// the caller's execution context; the root table has one entry per `l1` index, each holding
    /// the physical base of an `l2` table, and so on down to a leaf PTE at `l3`.
    pub fn walk(
        &self,
        bus: &PhysicalBus,
        ptbr: PhysicalAddress,
        va: VirtualAddress,
        _asn: Asn,
        access: AccessType,
        mode: Mode,
        cpu_id: usize,
    ) -> Result<Translation, MemoryFault> {
        self.walks.incr();
        let idx = va.table_indices();

        let l1_entry = self.read_entry(bus, ptbr, idx.l1, cpu_id)?;
        if !l1_entry.valid {
            return Err(self.fault(va, access, cpu_id, WalkFaultKind::Missing));
        }

        let l2_table = PhysicalAddress::new(l1_entry.physical_base());
        let l2_entry = self.read_entry(bus, l2_table, idx.l2, cpu_id)?;
        if !l2_entry.valid {
            return Err(self.fault(va, access, cpu_id, WalkFaultKind::Missing));
        }

        let l3_table = PhysicalAddress::new(l2_entry.physical_base());
        let leaf = self.read_entry(bus, l3_table, idx.l3, cpu_id)?;
        if !leaf.valid {
            return Err(self.fault(va, access, cpu_id, WalkFaultKind::Missing));
        }

        let denies = match access {
            AccessType::Read => leaf.fault_on_read,
            AccessType::Write => leaf.fault_on_write,
            AccessType::Execute => leaf.fault_on_execute,
        };
        if denies || (leaf.kernel_only() && mode == Mode::User) {
            return Err(self.fault(va, access, cpu_id, WalkFaultKind::Protection));
        }

        let granularity = leaf.granularity.0;
        let window_mask = granularity.window_size() - 1;
        let base = leaf.physical_base() & !window_mask;
        let pa = PhysicalAddress::new(base | va.offset_within(granularity));

        trace!(va = ?va, pa = ?pa, ?granularity, cpu_id, "page table walk resolved");
        Ok(Translation {
            pa,
            granularity,
            readable: !leaf.fault_on_read,
            writable: !leaf.fault_on_write,
            executable: !leaf.fault_on_execute,
            global: leaf.asm_bit,
        })
    }
}

enum WalkFaultKind {
    Missing,
    Protection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::MmioRouter;

    fn test_bus() -> PhysicalBus {
        PhysicalBus::new(4 * 1024 * 1024, MmioRouter::new())
    }

    fn write_pte(bus: &PhysicalBus, table_base: u64, index: usize, pte: PageTableEntry) {
        bus.write(PhysicalAddress::new(table_base + (index as u64) * 8), 8, pte.to_raw(), 0, true).unwrap();
    }

    #[test]
    fn three_level_walk_resolves_leaf() {
        let bus = test_bus();
        let ptbr = 0x1000u64;
        let l2_base = 0x2000u64;
        let l3_base = 0x3000u64;

        write_pte(&bus, ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
        write_pte(&bus, l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
        write_pte(
            &bus,
            l3_base,
            2,
            PageTableEntry { valid: true, pfn: 0x10, ..Default::default() },
        );

        let walker = PageTableWalker::new();
        let translation = walker
            .walk(&bus, PhysicalAddress::new(ptbr), VirtualAddress::new(0x4000), 0, AccessType::Read, Mode::User, 0)
            .unwrap();
        assert_eq!(translation.pa, PhysicalAddress::new(0x10 << 13));
        assert_eq!(walker.walks.get(), 1);
    }

    #[test]
    fn missing_l1_entry_is_page_fault() {
        let bus = test_bus();
        let walker = PageTableWalker::new();
        let result = walker.walk(&bus, PhysicalAddress::new(0x1000), VirtualAddress::new(0x4000), 0, AccessType::Read, Mode::User, 0);
        assert!(matches!(result, Err(MemoryFault::PageFault { .. })));
    }

    #[test]
    fn fault_on_write_leaf_is_protection_fault() {
        let bus = test_bus();
        let ptbr = 0x1000u64;
        let l2_base = 0x2000u64;
        let l3_base = 0x3000u64;
        write_pte(&bus, ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
        write_pte(&bus, l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
        write_pte(
            &bus,
            l3_base,
            0,
            PageTableEntry { valid: true, fault_on_write: true, pfn: 0x10, ..Default::default() },
        );

        let walker = PageTableWalker::new();
        let result = walker.walk(&bus, PhysicalAddress::new(ptbr), VirtualAddress::new(0x0), 0, AccessType::Write, Mode::User, 0);
        assert!(matches!(result, Err(MemoryFault::ProtectionFault { .. })));
    }

    #[test]
    fn kernel_only_page_denied_in_user_mode() {
        let bus = test_bus();
        let ptbr = 0x1000u64;
        let l2_base = 0x2000u64;
        let l3_base = 0x3000u64;
        write_pte(&bus, ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
        write_pte(&bus, l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
        let mut leaf = PageTableEntry { valid: true, pfn: 0x10, ..Default::default() };
        leaf.set_kernel_only(true);
        write_pte(&bus, l3_base, 0, leaf);

        let walker = PageTableWalker::new();
        let result = walker.walk(&bus, PhysicalAddress::new(ptbr), VirtualAddress::new(0x0), 0, AccessType::Read, Mode::User, 0);
        assert!(matches!(result, Err(MemoryFault::ProtectionFault { .. })));

        let ok = walker.walk(&bus, PhysicalAddress::new(ptbr), VirtualAddress::new(0x0), 0, AccessType::Read, Mode::Kernel, 0);
        assert!(ok.is_ok());
    }
}
