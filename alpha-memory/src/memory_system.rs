//! The front door: wires every component from a validated [`Config`] once, then serves
//! `read`/`write`/`load_locked`/`store_conditional`/`prefetch`/`invalidate_line`/`flush_line`/
//! `barrier`, per §4.10 and §4.11. This is the only place in the crate that constructs a `Cache`
//! or a `CoherenceBus`.

use {
    crate::{
        addr::{AccessType, Asn, Mode, PhysicalAddress, VirtualAddress, LINE_SIZE},
        barrier::{BarrierEngine, BarrierHandler, BarrierKind},
        cache::{Cache, NextLevel},
        coherence::{CoherenceBus, CoherenceSubscriber},
        config::Config,
        context::{ExecutionContext, PalFunctionCode, PalRegistry},
        error::{ConfigError, FaultContext, MemoryFault},
        physical::{MmioRouter, PhysicalBus},
        reservation::ReservationTable,
        stats::{CacheStatsSnapshot, MemorySystemStats},
        tlb::SplitTlb,
        walker::PageTableWalker,
    },
    std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Duration,
    },
    tracing::trace,
};

/// Per-CPU private state: a split TLB and private L1 instruction/data caches.
struct CpuSlot {
    tlb: SplitTlb,
    l1i: Arc<Cache>,
    l1d: Arc<Cache>,
}

/// Services the `BarrierEngine`'s worker pool against this system's own cache handles. Built once
/// by [`MemorySystem::new`] and handed to the engine as its `BarrierHandler`.
struct SmpBarrierHandler {
    l1d: Vec<Arc<Cache>>,
    l1i: Vec<Arc<Cache>>,
    l2: Arc<Cache>,
    l3: Arc<Cache>,
}

impl BarrierHandler for SmpBarrierHandler {
    fn drain_writes(&self, cpu_id: usize) -> Result<(), MemoryFault> {
        self.l1d[cpu_id].flush_all(cpu_id)?;
        self.l2.flush_all(cpu_id)?;
        self.l3.flush_all(cpu_id)?;
        Ok(())
    }

    fn drain_write_only(&self, cpu_id: usize) -> Result<(), MemoryFault> {
        self.drain_writes(cpu_id)
    }

    fn await_trap_retirement(&self, _cpu_id: usize) -> Result<(), MemoryFault> {
        // Trap retirement belongs to the core's execution pipeline, out of scope here (§1). By
        // the time a TRAPB/EXCB reaches the memory subsystem there is nothing left to drain.
        Ok(())
    }

    fn invalidate_instruction_cache(&self, cpu_id: usize) -> Result<(), MemoryFault> {
        self.l1i[cpu_id].invalidate_all();
        Ok(())
    }

    fn prefetch(&self, cpu_id: usize, modified: bool) -> Result<(), MemoryFault> {
        // FETCH/FETCH_M carry an address in the real ISA; BarrierRequest does not model one, so
        // the addressed form is served directly by `MemorySystem::prefetch` instead of through
        // the barrier engine. Nothing to do here beyond acknowledging the request.
        let _ = (cpu_id, modified);
        Ok(())
    }
}

/// The fully wired SMP memory subsystem.
pub struct MemorySystem {
    cpus: Vec<CpuSlot>,
    l2: Arc<Cache>,
    l3: Arc<Cache>,
    bus: Arc<PhysicalBus>,
    walker: PageTableWalker,
    reservations: Arc<ReservationTable>,
    coherence: Arc<CoherenceBus>,
    barriers: BarrierEngine,
    barrier_seq: AtomicU64,
    stats: MemorySystemStats,
    /// `RPCC`/`RS`/`RC` have no memory effect and are dispatched by PAL function code rather
    /// than address (§4.9 item 5), so they bypass the TLB/cache path entirely.
    pal: PalRegistry,
}

impl MemorySystem {
    /// Validate `config`, then wire every component: per-CPU split TLB and private L1D/L1I
    /// caches sharing one `SharingDirectory` each, a unified L2 and L3, the physical bus, the
    /// page-table walker, the reservation table, the coherence bus and the barrier engine.
    /// `mmio` is the embedder's already-populated device-window router (device models themselves
    /// are out of scope for this crate, §1); `pal` is the embedder's registered PAL entry points.
    pub fn new(config: Config, mmio: MmioRouter, pal: PalRegistry) -> Result<Self, ConfigError> {
        config.validate()?;

        let ram_bytes = (config.memory.size_gb as usize) * 1024 * 1024 * 1024;
        let bus = Arc::new(PhysicalBus::new(ram_bytes, mmio));

        let l3 = Arc::new(Cache::new(
            900,
            "L3",
            None,
            config.l3,
            config.policy.write,
            config.policy.replacement,
            NextLevel::Bus(bus.clone()),
            None,
        ));
        let l2 = Arc::new(Cache::new(
            901,
            "L2",
            None,
            config.l2,
            config.policy.write,
            config.policy.replacement,
            NextLevel::Cache(l3.clone()),
            None,
        ));

        // One directory per level, shared across that level's sibling per-CPU instances, so a
        // fill on any CPU's L1D can see whether another CPU's L1D already holds the line (§4.4's
        // `I + read → E if no other cache has it, else S`), and likewise for L1I.
        let l1d_directory = Cache::new_directory();
        let l1i_directory = Cache::new_directory();

        let mut l1d_caches = Vec::with_capacity(config.cpu.count);
        let mut l1i_caches = Vec::with_capacity(config.cpu.count);
        let mut cpus = Vec::with_capacity(config.cpu.count);
        for cpu_id in 0..config.cpu.count {
            let l1d = Arc::new(Cache::new(
                cpu_id * 2,
                "L1D",
                Some(cpu_id),
                config.l1d,
                config.policy.write,
                config.policy.replacement,
                NextLevel::Cache(l2.clone()),
                Some(l1d_directory.clone()),
            ));
            let l1i = Arc::new(Cache::new(
                cpu_id * 2 + 1,
                "L1I",
                Some(cpu_id),
                config.l1i,
                config.policy.write,
                config.policy.replacement,
                NextLevel::Cache(l2.clone()),
                Some(l1i_directory.clone()),
            ));
            Cache::register_in_directory(&l1d);
            Cache::register_in_directory(&l1i);
            l1d_caches.push(l1d.clone());
            l1i_caches.push(l1i.clone());
            cpus.push(CpuSlot {
                tlb: SplitTlb::new(config.tlb.i_entries, config.tlb.d_entries),
                l1i,
                l1d,
            });
        }

        let reservations = Arc::new(ReservationTable::new(config.cpu.count));

        let mut subscribers: Vec<Arc<dyn CoherenceSubscriber>> = Vec::new();
        for cache in l1d_caches.iter().chain(l1i_caches.iter()) {
            subscribers.push(cache.clone());
        }
        subscribers.push(l2.clone());
        subscribers.push(l3.clone());
        subscribers.push(reservations.clone());

        let timeout = Duration::from_millis(config.barriers.timeout_ms);
        let coherence = Arc::new(CoherenceBus::new(subscribers, 256, timeout));

        let mut every_cache: Vec<&Arc<Cache>> = l1d_caches.iter().chain(l1i_caches.iter()).collect();
        every_cache.push(&l2);
        every_cache.push(&l3);
        for cache in every_cache {
            cache.attach_coherence(coherence.clone());
        }
        bus.attach_coherence(coherence.clone());

        let handler: Arc<dyn BarrierHandler> = Arc::new(SmpBarrierHandler {
            l1d: l1d_caches,
            l1i: l1i_caches,
            l2: l2.clone(),
            l3: l3.clone(),
        });
        let barriers = BarrierEngine::new(handler, config.cpu.count.max(1), timeout);

        Ok(Self {
            cpus,
            l2,
            l3,
            bus,
            walker: PageTableWalker::new(),
            reservations,
            coherence,
            barriers,
            barrier_seq: AtomicU64::new(0),
            stats: MemorySystemStats::default(),
            pal,
        })
    }

    /// Dispatch a PAL function code (`RPCC`/`RS`/`RC` and similar register-level operations with
    /// no memory effect). Returns `None` if no handler was registered for `code`.
    pub fn invoke_pal(&self, code: PalFunctionCode, cpu_id: usize) -> Option<u64> {
        self.pal.invoke(code, cpu_id)
    }

    fn check_alignment(&self, va: VirtualAddress, size: usize, access: AccessType, cpu_id: usize, allow_unaligned: bool) -> Result<(), MemoryFault> {
        let misaligned = !allow_unaligned && !va.is_aligned(size.max(1) as u64);
        if !matches!(size, 1 | 2 | 4 | 8) || misaligned {
            self.stats.faults.incr();
            return Err(MemoryFault::AlignmentFault {
                ctx: FaultContext::new(va, access, cpu_id, 0),
                size,
            });
        }
        Ok(())
    }

    /// Resolve `va` to a physical address for `access`, consulting the CPU's TLB and falling
    /// back to a page-table walk (insert, then treated as resolved) on miss, per §4.10 step 3.
    fn translate(&self, cpu: &CpuSlot, cpu_id: usize, va: VirtualAddress, access: AccessType, ctx: &dyn ExecutionContext) -> Result<PhysicalAddress, MemoryFault> {
        if !ctx.mmu_enabled() || ctx.mode() == Mode::Pal {
            return Ok(PhysicalAddress::new(va.as_u64()));
        }

        let asn = ctx.current_asn();
        let tlb = match access {
            AccessType::Execute => &cpu.tlb.instruction,
            AccessType::Read | AccessType::Write => &cpu.tlb.data,
        };

        let lookup = tlb.translate(va, asn, access);
        if lookup.hit {
            let allowed = match access {
                AccessType::Read => lookup.readable,
                AccessType::Write => lookup.writable,
                AccessType::Execute => lookup.executable,
            };
            if !allowed {
                self.stats.faults.incr();
                return Err(MemoryFault::ProtectionFault {
                    ctx: FaultContext::new(va, access, cpu_id, 0),
                });
            }
            return Ok(PhysicalAddress::new(lookup.pa.expect("hit lookup always carries a pa")));
        }

        let translation = self
            .walker
            .walk(&self.bus, ctx.ptbr(), va, asn, access, ctx.mode(), cpu_id)
            .map_err(|fault| {
                self.stats.faults.incr();
                fault
            })?;
        self.stats.page_table_walks.incr();
        tlb.insert(va, asn, translation.global, translation);
        Ok(translation.pa)
    }

    /// Read `size` bytes at `va`. `access` is `Read` for data or `Execute` for an instruction
    /// fetch; the two draw from different TLBs and different private L1 caches.
    pub fn read(&self, va: VirtualAddress, size: usize, access: AccessType, ctx: &dyn ExecutionContext) -> Result<u64, MemoryFault> {
        let cpu_id = ctx.cpu_id();
        self.check_alignment(va, size, access, cpu_id, ctx.unaligned_access_allowed())?;
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, access, ctx)?;
        let cache = if access == AccessType::Execute { &cpu.l1i } else { &cpu.l1d };
        self.stats.reads.incr();
        trace!(cpu_id, va = ?va, pa = ?pa, size, ?access, "memory read");
        cache.read(pa, size, cpu_id).map_err(|fault| {
            self.stats.faults.incr();
            fault
        })
    }

    /// Write `size` bytes of `value` at `va`.
    pub fn write(&self, va: VirtualAddress, size: usize, value: u64, ctx: &dyn ExecutionContext) -> Result<(), MemoryFault> {
        let cpu_id = ctx.cpu_id();
        self.check_alignment(va, size, AccessType::Write, cpu_id, ctx.unaligned_access_allowed())?;
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, AccessType::Write, ctx)?;
        self.stats.writes.incr();
        trace!(cpu_id, va = ?va, pa = ?pa, size, "memory write");
        cpu.l1d.write(pa, size, value, cpu_id).map_err(|fault| {
            self.stats.faults.incr();
            fault
        })?;
        // Invalidate any overlapping reservation synchronously with the write itself, rather
        // than relying solely on the asynchronous `CoherenceBus` dispatch: SC must observe a
        // concurrent write to its line immediately, not whenever the dispatcher thread catches
        // up (§8's SC-linearizable-with-coherent-writes guarantee).
        self.reservations.clear_overlapping(pa.line_address(), LINE_SIZE as usize, None);
        Ok(())
    }

    /// A normal read that additionally records a reservation on the accessed line, per §4.10
    /// step 6.
    pub fn load_locked(&self, va: VirtualAddress, size: usize, ctx: &dyn ExecutionContext) -> Result<u64, MemoryFault> {
        let cpu_id = ctx.cpu_id();
        self.check_alignment(va, size, AccessType::Read, cpu_id, ctx.unaligned_access_allowed())?;
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, AccessType::Read, ctx)?;
        let value = cpu.l1d.read(pa, size, cpu_id)?;
        self.reservations.set(cpu_id, pa, size);
        self.stats.reads.incr();
        self.stats.load_locked.incr();
        Ok(value)
    }

    /// Perform the write only if `cpu_id`'s reservation over the target line is still valid
    /// (§4.10 step 7). Always clears the issuing CPU's reservation on return, win or lose.
    pub fn store_conditional(&self, va: VirtualAddress, size: usize, value: u64, ctx: &dyn ExecutionContext) -> Result<bool, MemoryFault> {
        let cpu_id = ctx.cpu_id();
        self.check_alignment(va, size, AccessType::Write, cpu_id, ctx.unaligned_access_allowed())?;
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, AccessType::Write, ctx)?;

        if !self.reservations.check(cpu_id, pa, size) {
            self.reservations.clear_cpu(cpu_id);
            self.stats.store_conditional_failure.incr();
            return Ok(false);
        }

        cpu.l1d.write(pa, size, value, cpu_id)?;
        self.reservations.clear_overlapping(pa.line_address(), LINE_SIZE as usize, None);
        self.reservations.clear_cpu(cpu_id);
        self.stats.writes.incr();
        self.stats.store_conditional_success.incr();
        Ok(true)
    }

    /// Bring `va`'s line into the issuing CPU's L1D without altering its contents.
    pub fn prefetch(&self, va: VirtualAddress, ctx: &dyn ExecutionContext, want_exclusive: bool) -> Result<(), MemoryFault> {
        let cpu_id = ctx.cpu_id();
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, AccessType::Read, ctx)?;
        cpu.l1d.prefetch(pa, cpu_id, want_exclusive)
    }

    /// Drop `va`'s line from the issuing CPU's L1D without writing it back.
    pub fn invalidate_line(&self, va: VirtualAddress, ctx: &dyn ExecutionContext) -> Result<(), MemoryFault> {
        let cpu_id = ctx.cpu_id();
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, AccessType::Read, ctx)?;
        cpu.l1d.invalidate(pa);
        Ok(())
    }

    /// Write `va`'s line back if dirty, keeping it cached in the issuing CPU's L1D.
    pub fn flush_line(&self, va: VirtualAddress, ctx: &dyn ExecutionContext) -> Result<(), MemoryFault> {
        let cpu_id = ctx.cpu_id();
        let cpu = &self.cpus[cpu_id];
        let pa = self.translate(cpu, cpu_id, va, AccessType::Read, ctx)?;
        cpu.l1d.flush(pa, cpu_id)
    }

    /// Submit an SMP barrier (`MB`/`WMB`/`TRAPB`/`EXCB`/`IMB`/`FETCH`/`FETCH_M`) and block the
    /// caller until it completes or times out (§4.9).
    pub fn barrier(&self, kind: BarrierKind, ctx: &dyn ExecutionContext) -> Result<(), MemoryFault> {
        let seq = self.barrier_seq.fetch_add(1, Ordering::Relaxed);
        self.barriers.submit(kind, ctx.cpu_id(), seq)
    }

    /// TLB shootdown: invalidate `va`/`asn` on every CPU's TLBs, per §5's cross-CPU invalidation
    /// ordering guarantee.
    pub fn invalidate_tlb_entry(&self, va: VirtualAddress, asn: Asn) {
        for cpu in &self.cpus {
            cpu.tlb.invalidate_entry(va, asn);
        }
    }

    pub fn invalidate_tlb_instruction(&self, va: VirtualAddress, asn: Asn) {
        for cpu in &self.cpus {
            cpu.tlb.invalidate_instruction(va, asn);
        }
    }

    pub fn invalidate_tlb_data(&self, va: VirtualAddress, asn: Asn) {
        for cpu in &self.cpus {
            cpu.tlb.invalidate_data(va, asn);
        }
    }

    pub fn invalidate_tlb_by_asn(&self, asn: Asn) {
        for cpu in &self.cpus {
            cpu.tlb.invalidate_by_asn(asn);
        }
    }

    pub fn invalidate_tlb_all(&self) {
        for cpu in &self.cpus {
            cpu.tlb.invalidate_all();
        }
    }

    /// Drain pending barrier work and stop the worker pool. Idempotent.
    pub fn shutdown(&self) {
        self.barriers.shutdown();
    }

    pub fn stats(&self) -> &MemorySystemStats {
        &self.stats
    }

    pub fn walker_walks(&self) -> u64 {
        self.walker.walks.get()
    }

    pub fn l1d_stats(&self, cpu_id: usize) -> CacheStatsSnapshot {
        self.cpus[cpu_id].l1d.stats()
    }

    pub fn l1i_stats(&self, cpu_id: usize) -> CacheStatsSnapshot {
        self.cpus[cpu_id].l1i.stats()
    }

    pub fn l2_stats(&self) -> CacheStatsSnapshot {
        self.l2.stats()
    }

    pub fn l3_stats(&self) -> CacheStatsSnapshot {
        self.l3.stats()
    }

    pub fn l1d(&self, cpu_id: usize) -> &Cache {
        &self.cpus[cpu_id].l1d
    }

    pub fn l1i(&self, cpu_id: usize) -> &Cache {
        &self.cpus[cpu_id].l1i
    }

    pub fn l2(&self) -> &Cache {
        &self.l2
    }

    pub fn l3(&self) -> &Cache {
        &self.l3
    }

    pub fn mmio(&self) -> &MmioRouter {
        self.bus.mmio()
    }

    pub fn ram_len(&self) -> usize {
        self.bus.ram_len()
    }

    /// Number of events the coherence bus has been asked to publish (for test introspection);
    /// the bus itself tracks no cumulative counter, so this exposes the handle rather than a tally.
    pub fn coherence(&self) -> &CoherenceBus {
        &self.coherence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, pte::PageTableEntry};

    struct TestCtx {
        cpu_id: usize,
        asn: Asn,
        mode: Mode,
        mmu_enabled: bool,
        ptbr: PhysicalAddress,
        unaligned: bool,
    }

    impl ExecutionContext for TestCtx {
        fn cpu_id(&self) -> usize {
            self.cpu_id
        }
        fn current_asn(&self) -> Asn {
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
            self.unaligned
        }
    }

    fn direct_ctx(cpu_id: usize) -> TestCtx {
        TestCtx { cpu_id, asn: 0, mode: Mode::Kernel, mmu_enabled: false, ptbr: PhysicalAddress::new(0), unaligned: false }
    }

    fn one_cpu_system() -> MemorySystem {
        MemorySystem::new(Config::minimal_for_tests(), MmioRouter::new(), PalRegistry::new()).unwrap()
    }

    fn two_cpu_system() -> MemorySystem {
        let mut config = Config::minimal_for_tests();
        config.cpu.count = 2;
        MemorySystem::new(config, MmioRouter::new(), PalRegistry::new()).unwrap()
    }

    /// `flush_line` only pushes a dirty line one level down; the walker reads straight off the
    /// physical bus (§4.6), so a test that writes page-table bytes through the cache hierarchy
    /// and then walks them has to drain every level down to the bus itself.
    fn push_to_bus(system: &MemorySystem, va: VirtualAddress) {
        let pa = PhysicalAddress::new(va.as_u64());
        system.l1d(0).flush(pa, 0).unwrap();
        system.l2().flush(pa, 0).unwrap();
        system.l3().flush(pa, 0).unwrap();
    }

    #[test]
    fn direct_map_round_trip() {
        let system = one_cpu_system();
        let ctx = direct_ctx(0);
        system.write(VirtualAddress::new(0x1_0000), 8, 0xDEAD_BEEF_CAFE_BABE, &ctx).unwrap();
        let value = system.read(VirtualAddress::new(0x1_0000), 8, AccessType::Read, &ctx).unwrap();
        assert_eq!(value, 0xDEAD_BEEF_CAFE_BABE);
        system.read(VirtualAddress::new(0x1_0000), 8, AccessType::Read, &ctx).unwrap();
        assert_eq!(system.l1d_stats(0).hits, 1);
    }

    #[test]
    fn tlb_miss_then_walk_then_hit() {
        let system = one_cpu_system();
        let write_ctx = direct_ctx(0);
        let ptbr = 0x1000u64;
        let l2_base = 0x2000u64;
        let l3_base = 0x3000u64;
        // The walker reads PTEs straight off the physical bus, bypassing the cache hierarchy
        // (§4.6), so each write must be flushed back to the bus before the walk can see it.
        let write_pte = |base: u64, index: usize, pte: PageTableEntry| {
            let addr = VirtualAddress::new(base + (index as u64) * 8);
            system.write(addr, 8, pte.to_raw(), &write_ctx).unwrap();
            push_to_bus(&system, addr);
        };
        write_pte(ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
        write_pte(l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
        write_pte(l3_base, 2, PageTableEntry { valid: true, pfn: 0x10, ..Default::default() });

        let ctx = TestCtx { cpu_id: 0, asn: 0, mode: Mode::User, mmu_enabled: true, ptbr: PhysicalAddress::new(ptbr), unaligned: false };
        let value = system.read(VirtualAddress::new(0x4000), 4, AccessType::Read, &ctx).unwrap();
        assert_eq!(value, 0);
        assert_eq!(system.walker_walks(), 1);

        system.read(VirtualAddress::new(0x4000), 4, AccessType::Read, &ctx).unwrap();
        assert_eq!(system.walker_walks(), 1);
    }

    #[test]
    fn protection_fault_denies_write_and_allocates_nothing() {
        let system = one_cpu_system();
        let write_ctx = direct_ctx(0);
        let ptbr = 0x1000u64;
        let l2_base = 0x2000u64;
        let l3_base = 0x3000u64;
        let write_pte = |base: u64, index: usize, pte: PageTableEntry| {
            let addr = VirtualAddress::new(base + (index as u64) * 8);
            system.write(addr, 8, pte.to_raw(), &write_ctx).unwrap();
            push_to_bus(&system, addr);
        };
        write_pte(ptbr, 0, PageTableEntry { valid: true, pfn: (l2_base >> 13) as u32, ..Default::default() });
        write_pte(l2_base, 0, PageTableEntry { valid: true, pfn: (l3_base >> 13) as u32, ..Default::default() });
        write_pte(l3_base, 0, PageTableEntry { valid: true, fault_on_write: true, pfn: 0x10, ..Default::default() });

        let ctx = TestCtx { cpu_id: 0, asn: 0, mode: Mode::User, mmu_enabled: true, ptbr: PhysicalAddress::new(ptbr), unaligned: false };
        let result = system.write(VirtualAddress::new(0x0), 4, 1, &ctx);
        assert!(matches!(result, Err(MemoryFault::ProtectionFault { .. })));
        assert!(!system.l1d(0).contains(PhysicalAddress::new(0x20000)));
    }

    #[test]
    fn load_locked_store_conditional_fails_after_other_cpu_write() {
        let system = two_cpu_system();
        let cpu0 = direct_ctx(0);
        let cpu1 = direct_ctx(1);
        let pa = VirtualAddress::new(0x2_0000);

        let x = system.load_locked(pa, 8, &cpu0).unwrap();
        system.write(pa, 8, x + 1, &cpu1).unwrap();
        let succeeded = system.store_conditional(pa, 8, x | 1, &cpu0).unwrap();
        assert!(!succeeded);
    }

    #[test]
    fn load_locked_store_conditional_succeeds_uninterrupted() {
        let system = one_cpu_system();
        let cpu0 = direct_ctx(0);
        let pa = VirtualAddress::new(0x2_0000);

        let x = system.load_locked(pa, 8, &cpu0).unwrap();
        let succeeded = system.store_conditional(pa, 8, x | 1, &cpu0).unwrap();
        assert!(succeeded);
    }

    #[test]
    fn mb_barrier_completes() {
        let system = one_cpu_system();
        let ctx = direct_ctx(0);
        system.write(VirtualAddress::new(0x100), 8, 1, &ctx).unwrap();
        system.barrier(BarrierKind::Mb, &ctx).unwrap();
        assert_eq!(system.stats().faults.get(), 0);
        system.shutdown();
    }

    #[test]
    fn misaligned_access_without_unaligned_flag_faults() {
        let system = one_cpu_system();
        let ctx = direct_ctx(0);
        let result = system.read(VirtualAddress::new(0x101), 4, AccessType::Read, &ctx);
        assert!(matches!(result, Err(MemoryFault::AlignmentFault { .. })));
    }
}
