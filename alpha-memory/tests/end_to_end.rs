//! End-to-end scenarios against a fully wired `MemorySystem`, one per case named in §8:
//! direct-map RAM round trip, a sparse MMIO lane, TLB miss → walk → retry, a protection fault,
//! LL/SC success and failure, and MB ordering observed across two CPU threads.

use {
    alpha_memory::{
        AccessType, BarrierKind, Config, ExecutionContext, MemorySystem, MemoryFault, Mode,
        MmioRouter, PhysicalAddress, VirtualAddress,
    },
    alpha_memory::context::PalRegistry,
    alpha_memory::physical::{DeviceAccess, MmioWindow},
    alpha_memory::config::WindowKind,
    alpha_memory::pte::PageTableEntry,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Barrier,
    },
};

struct FixedCtx {
    cpu_id: usize,
    asn: u8,
    mode: Mode,
    mmu_enabled: bool,
    ptbr: PhysicalAddress,
}

impl ExecutionContext for FixedCtx {
    fn cpu_id(&self) -> usize {
        self.cpu_id
    }
    fn current_asn(&self) -> u8 {
        self.asn
    }
    fn mode(&self) -> Mode {
        self.mode
    }
    fn mmu_enabled(&self) -> bool {
        self.mmu_enabled
    }
    fn ptbr(&self) -> PhysicalAddress {
        self.ptbr
    }
    fn unaligned_access_allowed(&self) -> bool {
        false
    }
}

fn flat_ctx(cpu_id: usize) -> FixedCtx {
    FixedCtx { cpu_id, asn: 0, mode: Mode::Kernel, mmu_enabled: false, ptbr: PhysicalAddress::new(0) }
}

/// Push a value written through the cache hierarchy all the way down to the physical bus, one
/// level at a time, since `Cache::flush` only drains one level per call (§4.6).
fn push_to_bus(system: &MemorySystem, va: VirtualAddress) {
    let pa = PhysicalAddress::new(va.as_u64());
    system.l1d(0).flush(pa, 0).unwrap();
    system.l2().flush(pa, 0).unwrap();
    system.l3().flush(pa, 0).unwrap();
}

fn build_system(cpu_count: usize, mmio: MmioRouter) -> MemorySystem {
    let mut config = Config::minimal_for_tests();
    config.cpu.count = cpu_count;
    MemorySystem::new(config, mmio, PalRegistry::new()).unwrap()
}

#[test]
fn direct_map_ram_round_trip() {
    let system = build_system(1, MmioRouter::new());
    let ctx = flat_ctx(0);

    system.write(VirtualAddress::new(0x1000), 8, 0x1122_3344_5566_7788, &ctx).unwrap();
    let value = system.read(VirtualAddress::new(0x1000), 8, AccessType::Read, &ctx).unwrap();
    assert_eq!(value, 0x1122_3344_5566_7788);

    // A second read should now hit in L1D rather than reissuing to the bus.
    system.read(VirtualAddress::new(0x1000), 8, AccessType::Read, &ctx).unwrap();
    assert_eq!(system.l1d_stats(0).hits, 1);
}

struct Scratchpad {
    last_write: AtomicU64,
}

impl DeviceAccess for Scratchpad {
    fn read(&self, _bus_addr: u64, _size: usize) -> u64 {
        self.last_write.load(Ordering::Relaxed)
    }
    fn write(&self, _bus_addr: u64, _size: usize, value: u64) {
        self.last_write.store(value, Ordering::Relaxed);
    }
}

#[test]
fn sparse_mmio_window_round_trip() {
    let mmio = MmioRouter::new();
    let device = Arc::new(Scratchpad { last_write: AtomicU64::new(0) });
    mmio.register(MmioWindow {
        kind: WindowKind::Sparse,
        base: 0x8040_0000_0000,
        size: 0x1_0000,
        tag: "scratch".into(),
        handler: device.clone(),
    })
    .unwrap();
    let system = build_system(1, mmio);
    let ctx = flat_ctx(0);

    let va = VirtualAddress::new(0x8040_0000_0000 + 0x80);
    system.write(va, 4, 0xABCD, &ctx).unwrap();
    assert_eq!(device.last_write.load(Ordering::Relaxed), 0xABCD);

    let value = system.read(va, 4, AccessType::Read, &ctx).unwrap();
    assert_eq!(value, 0xABCD);
}

#[test]
fn tlb_miss_then_walk_then_retry_hits() {
    let system = build_system(1, MmioRouter::new());
    let write_ctx = flat_ctx(0);
    let (ptbr, l2_base, l3_base) = (0x1000u64, 0x2000u64, 0x3000u64);

    let write_pte = |base: u64, index: usize, pte: PageTableEntry| {
        let addr = VirtualAddress::new(base + (index as u64) * 8);
        system.write(addr, 8, pte.to_raw(), &write_ctx).unwrap();
        push_to_bus(&system, addr);
    };
    write_pte(ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
    write_pte(l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
    write_pte(l3_base, 1, PageTableEntry { valid: true, pfn: 0x20, ..Default::default() });

    let ctx = FixedCtx { cpu_id: 0, asn: 0, mode: Mode::User, mmu_enabled: true, ptbr: PhysicalAddress::new(ptbr) };
    let va = VirtualAddress::new(0x2000);

    system.read(va, 4, AccessType::Read, &ctx).unwrap();
    assert_eq!(system.walker_walks(), 1, "first access should miss the TLB and walk the page table");

    system.read(va, 4, AccessType::Read, &ctx).unwrap();
    assert_eq!(system.walker_walks(), 1, "second access should hit the TLB entry the walk installed");
}

#[test]
fn write_to_read_only_page_faults_and_leaves_cache_unfilled() {
    let system = build_system(1, MmioRouter::new());
    let write_ctx = flat_ctx(0);
    let (ptbr, l2_base, l3_base) = (0x1000u64, 0x2000u64, 0x3000u64);

    let write_pte = |base: u64, index: usize, pte: PageTableEntry| {
        let addr = VirtualAddress::new(base + (index as u64) * 8);
        system.write(addr, 8, pte.to_raw(), &write_ctx).unwrap();
        push_to_bus(&system, addr);
    };
    write_pte(ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
    write_pte(l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
    write_pte(l3_base, 0, PageTableEntry { valid: true, fault_on_write: true, pfn: 0x30, ..Default::default() });

    let ctx = FixedCtx { cpu_id: 0, asn: 0, mode: Mode::User, mmu_enabled: true, ptbr: PhysicalAddress::new(ptbr) };
    let result = system.write(VirtualAddress::new(0x0), 4, 0xFF, &ctx);
    assert!(matches!(result, Err(MemoryFault::ProtectionFault { .. })));
    assert!(!system.l1d(0).contains(PhysicalAddress::new(0x30000)));
}

#[test]
fn load_locked_store_conditional_succeeds_when_uncontended() {
    let system = build_system(1, MmioRouter::new());
    let ctx = flat_ctx(0);
    let va = VirtualAddress::new(0x4000);

    let current = system.load_locked(va, 8, &ctx).unwrap();
    assert!(system.store_conditional(va, 8, current + 1, &ctx).unwrap());
    assert_eq!(system.read(va, 8, AccessType::Read, &ctx).unwrap(), current + 1);
}

#[test]
fn load_locked_store_conditional_fails_when_another_cpu_writes_first() {
    let system = build_system(2, MmioRouter::new());
    let cpu0 = flat_ctx(0);
    let cpu1 = flat_ctx(1);
    let va = VirtualAddress::new(0x5000);

    let current = system.load_locked(va, 8, &cpu0).unwrap();
    system.write(va, 8, current + 99, &cpu1).unwrap();

    assert!(!system.store_conditional(va, 8, current + 1, &cpu0).unwrap());
    assert_eq!(system.read(va, 8, AccessType::Read, &cpu0).unwrap(), current + 99);
}

#[test]
fn memory_barrier_orders_writes_observed_across_two_cpu_threads() {
    let system = Arc::new(build_system(2, MmioRouter::new()));
    let flag_va = VirtualAddress::new(0x6000);
    let data_va = VirtualAddress::new(0x6100);
    let start = Arc::new(Barrier::new(2));

    let writer = {
        let system = system.clone();
        let start = start.clone();
        std::thread::spawn(move || {
            let ctx = flat_ctx(0);
            start.wait();
            system.write(data_va, 8, 0x42, &ctx).unwrap();
            system.barrier(BarrierKind::Mb, &ctx).unwrap();
            system.write(flag_va, 8, 1, &ctx).unwrap();
        })
    };

    let reader = {
        let system = system.clone();
        let start = start.clone();
        std::thread::spawn(move || {
            let ctx = flat_ctx(1);
            start.wait();
            loop {
                if system.read(flag_va, 8, AccessType::Read, &ctx).unwrap() == 1 {
                    system.barrier(BarrierKind::Mb, &ctx).unwrap();
                    return system.read(data_va, 8, AccessType::Read, &ctx).unwrap();
                }
                std::thread::yield_now();
            }
        })
    };

    writer.join().unwrap();
    let observed = reader.join().unwrap();
    assert_eq!(observed, 0x42);
    system.shutdown();
}
