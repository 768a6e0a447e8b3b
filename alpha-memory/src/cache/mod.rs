//! One level of the cache hierarchy (L1D, L1I, L2 or L3), per §4.4.
//!
//! Each level is an independent, lockable-per-set structure. L1D and L1I are instantiated once
//! per CPU (private caches); L2 and L3 are instantiated once and shared (§9's resolution of the
//! split-L1/unified-L2-L3 open question, recorded in DESIGN.md). Coherence between the several
//! private L1 instances is tracked by a [`SharingDirectory`] shared across the sibling instances
//! of one level; L2/L3 pass `None` since only one instance of those levels ever exists.

mod line;
mod set;

pub use line::MesiState;

use {
    crate::{
        addr::PhysicalAddress,
        coherence::{CoherenceBus, CoherenceEvent, CoherenceOp, CoherenceSubscriber},
        config::{CacheConfig, ReplacementPolicy, WritePolicy},
        error::{FaultContext, MemoryFault},
        physical::PhysicalBus,
        stats::{CacheStats, CacheStatsSnapshot},
    },
    line::CacheLine,
    once_cell::sync::OnceCell,
    set::CacheSet,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex, Weak,
        },
    },
    tracing::{error, trace, warn},
};

/// What a cache level fills from and writes back to on a miss/eviction.
pub enum NextLevel {
    Cache(Arc<Cache>),
    Bus(Arc<PhysicalBus>),
}

impl NextLevel {
    fn read_line(&self, line_pa: PhysicalAddress, buf: &mut [u8], cpu_id: usize) -> Result<(), MemoryFault> {
        match self {
            NextLevel::Cache(cache) => cache.read_line(line_pa, buf, cpu_id),
            NextLevel::Bus(bus) => bus.read_line(line_pa, buf, cpu_id),
        }
    }

    fn write_line(&self, line_pa: PhysicalAddress, data: &[u8], cpu_id: usize) -> Result<(), MemoryFault> {
        match self {
            NextLevel::Cache(cache) => cache.write_line(line_pa, data, cpu_id),
            NextLevel::Bus(bus) => bus.write_line(line_pa, data, cpu_id),
        }
    }
}

/// Tracks which sibling instances of one cache level (several private L1s) currently hold a
/// line, so a fill can decide `Exclusive` vs `Shared` and a write can decide whether to
/// broadcast `Invalidate`. Absent for unified levels (L2/L3), where only one instance exists.
///
/// Also holds a weak handle to every registered sibling, so that a miss can reach across to
/// whichever sibling the directory says owns the line and force a synchronous write-back before
/// filling from `next` (§4.4's `M → owner writes back, then supplies current data`), and so that
/// an ownership change can synchronously invalidate/downgrade whichever siblings previously held
/// the line. Without this, a line Modified only in one sibling's cache would never reach a
/// sibling that misses on it (the asynchronous `CoherenceBus` write-back/downgrade/invalidate
/// that follows a fill runs too late to supply the data the fill itself needs), and a sibling
/// that already cached the line would keep serving stale hits until the bus's dispatcher thread
/// happened to catch up.
pub(crate) struct SharingDirectory {
    owners: Mutex<HashMap<u64, Vec<usize>>>,
    siblings: Mutex<HashMap<usize, Weak<Cache>>>,
}

impl SharingDirectory {
    fn new() -> Self {
        Self { owners: Mutex::new(HashMap::new()), siblings: Mutex::new(HashMap::new()) }
    }

    fn register_sibling(&self, cache_id: usize, cache: &Arc<Cache>) {
        self.siblings.lock().unwrap().insert(cache_id, Arc::downgrade(cache));
    }

    /// Synchronously apply `op` to every registered sibling in `owner_ids` other than
    /// `requester_id`. Used both to force a write-back before a fill and to invalidate/downgrade
    /// stale copies the instant ownership changes, instead of waiting on the asynchronous
    /// `CoherenceBus` dispatch to get around to the same siblings.
    fn notify_siblings(&self, owner_ids: Vec<usize>, requester_id: usize, line_key: u64, op: CoherenceOp, cpu_id: usize) {
        if owner_ids.is_empty() {
            return;
        }
        let siblings = self.siblings.lock().unwrap();
        for owner_id in owner_ids {
            if owner_id == requester_id {
                continue;
            }
            if let Some(owner) = siblings.get(&owner_id).and_then(Weak::upgrade) {
                owner.snoop(PhysicalAddress::new(line_key), op, cpu_id);
            }
        }
    }

    /// Synchronously ask every other registered owner of `line_key` to write back its copy (if
    /// dirty) before the requester fills from `next`.
    fn writeback_owners(&self, requester_id: usize, line_key: u64, cpu_id: usize) {
        let owner_ids = self.owners.lock().unwrap().get(&line_key).cloned().unwrap_or_default();
        self.notify_siblings(owner_ids, requester_id, line_key, CoherenceOp::WriteBack, cpu_id);
    }

    /// Make `cache_id` the sole owner of `line_key`, synchronously invalidating whichever other
    /// siblings previously held it. Returns whether another instance held it.
    fn acquire_exclusive(&self, cache_id: usize, line_key: u64, cpu_id: usize) -> bool {
        let previous: Vec<usize> = {
            let mut owners = self.owners.lock().unwrap();
            let entry = owners.entry(line_key).or_default();
            let previous = entry.iter().copied().filter(|&id| id != cache_id).collect::<Vec<_>>();
            entry.clear();
            entry.push(cache_id);
            previous
        };
        let had_others = !previous.is_empty();
        self.notify_siblings(previous, cache_id, line_key, CoherenceOp::Invalidate, cpu_id);
        had_others
    }

    /// Add `cache_id` as a reader of `line_key`, synchronously downgrading whichever other
    /// siblings previously held it exclusively/modified. Returns whether another instance already
    /// held it.
    fn acquire_shared(&self, cache_id: usize, line_key: u64, cpu_id: usize) -> bool {
        let previous: Vec<usize> = {
            let mut owners = self.owners.lock().unwrap();
            let entry = owners.entry(line_key).or_default();
            let previous = entry.iter().copied().filter(|&id| id != cache_id).collect::<Vec<_>>();
            if !entry.contains(&cache_id) {
                entry.push(cache_id);
            }
            previous
        };
        let had_owner = !previous.is_empty();
        self.notify_siblings(previous, cache_id, line_key, CoherenceOp::DowngradeToShared, cpu_id);
        had_owner
    }

    fn forget(&self, cache_id: usize, line_key: u64) {
        let mut owners = self.owners.lock().unwrap();
        if let Some(entry) = owners.get_mut(&line_key) {
            entry.retain(|&id| id != cache_id);
            if entry.is_empty() {
                owners.remove(&line_key);
            }
        }
    }
}

/// One level of the cache hierarchy.
pub struct Cache {
    id: usize,
    name: &'static str,
    /// `Some(cpu)` for a private per-CPU instance (L1D/L1I); `None` for a shared level (L2/L3).
    owner_cpu: Option<usize>,
    num_sets: usize,
    line_size: usize,
    line_shift: u32,
    index_bits: u32,
    policy: ReplacementPolicy,
    write_policy: WritePolicy,
    sets: Vec<CacheSet>,
    next: NextLevel,
    coherence: OnceCell<Arc<CoherenceBus>>,
    directory: Option<Arc<SharingDirectory>>,
    access_counter: AtomicU64,
    stats: CacheStats,
}

impl Cache {
    /// Crate-internal: every `Cache` is constructed once by
    /// [`crate::memory_system::MemorySystem::new`]'s builder, never directly by an embedder (§9's
    /// construction-time-builder note). `SharingDirectory` is `pub(crate)`, so a public
    /// constructor taking or returning it would leak a private type through a public interface.
    pub(crate) fn new(
        id: usize,
        name: &'static str,
        owner_cpu: Option<usize>,
        config: CacheConfig,
        write_policy: WritePolicy,
        policy: ReplacementPolicy,
        next: NextLevel,
        directory: Option<Arc<SharingDirectory>>,
    ) -> Self {
        Self {
            id,
            name,
            owner_cpu,
            num_sets: config.sets,
            line_size: config.line,
            line_shift: config.line.trailing_zeros(),
            index_bits: config.sets.trailing_zeros(),
            policy,
            write_policy,
            sets: (0..config.sets).map(|_| CacheSet::new(config.assoc, config.line)).collect(),
            next,
            coherence: OnceCell::new(),
            directory,
            access_counter: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// A fresh, unshared directory for a set of sibling per-CPU instances of one level.
    pub(crate) fn new_directory() -> Arc<SharingDirectory> {
        Arc::new(SharingDirectory::new())
    }

    /// Register `cache` with its own directory (a no-op for unified levels, which have none), so
    /// a sibling miss can reach it for a synchronous write-back. Called once by the builder right
    /// after each private L1 instance is constructed.
    pub(crate) fn register_in_directory(cache: &Arc<Cache>) {
        if let Some(dir) = &cache.directory {
            dir.register_sibling(cache.id, cache);
        }
    }

    /// Wire this cache's coherence publisher. Called once by the builder after every cache in
    /// the hierarchy has been constructed and handed to [`CoherenceBus::new`] as a subscriber.
    pub fn attach_coherence(&self, bus: Arc<CoherenceBus>) {
        let _ = self.coherence.set(bus);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        let (index, tag) = self.geometry(pa);
        self.sets[index].with_lock(|ways, _hand| set::find(ways, tag).is_some())
    }

    /// Dump `(state, tag)` for every way of `index`, for test introspection.
    pub fn dump_set(&self, index: usize) -> Vec<(MesiState, u64)> {
        self.sets[index].with_lock(|ways, _hand| ways.iter().map(|line| (line.state, line.tag)).collect())
    }

    fn geometry(&self, pa: PhysicalAddress) -> (usize, u64) {
        let masked = pa.as_u64() >> self.line_shift;
        let index = (masked as usize) & (self.num_sets - 1);
        let tag = masked >> self.index_bits;
        (index, tag)
    }

    fn line_key(&self, index: usize, tag: u64) -> u64 {
        ((tag << self.index_bits) | index as u64) << self.line_shift
    }

    fn next_stamp(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn machine_check(&self, pa: PhysicalAddress, cpu_id: usize) -> MemoryFault {
        error!(cache = self.name, pa = ?pa, cpu_id, "backing access failed during fill/write-back");
        MemoryFault::MachineCheck {
            ctx: FaultContext::new(crate::addr::VirtualAddress(pa.as_u64()), crate::addr::AccessType::Read, cpu_id, 0)
                .with_physical(pa),
        }
    }

    fn broadcast(&self, line_key: u64, op: CoherenceOp, cpu_id: usize) {
        if let Some(bus) = self.coherence.get() {
            bus.publish(CoherenceEvent { line_address: PhysicalAddress::new(line_key), op, source_cpu: cpu_id });
        }
    }

    fn claim_exclusive(&self, line_key: u64, cpu_id: usize) {
        if let Some(dir) = &self.directory {
            if dir.acquire_exclusive(self.id, line_key, cpu_id) {
                // Siblings in this directory were already invalidated synchronously above; the
                // broadcast still reaches non-sibling subscribers (e.g. `ReservationTable`).
                self.broadcast(line_key, CoherenceOp::Invalidate, cpu_id);
            }
        }
    }

    fn claim_shared_or_exclusive(&self, line_key: u64, cpu_id: usize) -> MesiState {
        match &self.directory {
            Some(dir) if dir.acquire_shared(self.id, line_key, cpu_id) => {
                self.broadcast(line_key, CoherenceOp::DowngradeToShared, cpu_id);
                MesiState::Shared
            }
            _ => MesiState::Exclusive,
        }
    }

    fn evict_and_fill(
        &self,
        ways: &mut Vec<CacheLine>,
        hand: &mut usize,
        index: usize,
        tag: u64,
        cpu_id: usize,
        for_write: bool,
    ) -> Result<usize, MemoryFault> {
        self.stats.misses.incr();
        let victim = set::select_victim(ways, hand, self.policy);
        if ways[victim].is_valid() {
            self.stats.evictions.incr();
            let old_key = self.line_key(index, ways[victim].tag);
            if ways[victim].is_dirty() {
                self.next
                    .write_line(PhysicalAddress::new(old_key), &ways[victim].data, cpu_id)
                    .map_err(|_| self.machine_check(PhysicalAddress::new(old_key), cpu_id))?;
                self.stats.write_backs.incr();
            }
            if let Some(dir) = &self.directory {
                dir.forget(self.id, old_key);
            }
        }

        let line_key = self.line_key(index, tag);
        if let Some(dir) = &self.directory {
            dir.writeback_owners(self.id, line_key, cpu_id);
        }
        let mut buf = vec![0u8; self.line_size];
        self.next
            .read_line(PhysicalAddress::new(line_key), &mut buf, cpu_id)
            .map_err(|_| self.machine_check(PhysicalAddress::new(line_key), cpu_id))?;

        let state = if for_write {
            self.claim_exclusive(line_key, cpu_id);
            MesiState::Modified
        } else {
            self.claim_shared_or_exclusive(line_key, cpu_id)
        };
        ways[victim].fill(tag, &buf, state);
        self.stats.fills.incr();
        trace!(cache = self.name, line_key, ?state, "cache fill");
        Ok(victim)
    }

    /// Ensure the line containing `line_pa` is present (filling from `next` if needed) and copy
    /// its bytes into `buf`, used when a higher cache level fills from this one.
    fn read_line(&self, line_pa: PhysicalAddress, buf: &mut [u8], cpu_id: usize) -> Result<(), MemoryFault> {
        let (index, tag) = self.geometry(line_pa);
        self.sets[index].with_lock(|ways, hand| {
            let way = match set::find(ways, tag) {
                Some(w) => {
                    self.stats.hits.incr();
                    w
                }
                None => self.evict_and_fill(ways, hand, index, tag, cpu_id, false)?,
            };
            ways[way].last_access = self.next_stamp();
            ways[way].referenced = true;
            buf.copy_from_slice(&ways[way].data[..buf.len()]);
            Ok(())
        })
    }

    /// Write a whole line back into this cache (used when a higher level evicts a dirty line
    /// that was filled from here); marks the line `Modified` so it is itself written back later.
    fn write_line(&self, line_pa: PhysicalAddress, data: &[u8], cpu_id: usize) -> Result<(), MemoryFault> {
        let (index, tag) = self.geometry(line_pa);
        let line_key = self.line_key(index, tag);
        self.sets[index].with_lock(|ways, hand| {
            let way = match set::find(ways, tag) {
                Some(w) => w,
                None => self.evict_and_fill(ways, hand, index, tag, cpu_id, true)?,
            };
            self.claim_exclusive(line_key, cpu_id);
            ways[way].data.copy_from_slice(data);
            ways[way].state = MesiState::Modified;
            ways[way].last_access = self.next_stamp();
            Ok(())
        })
    }

    /// Read `size` bytes at `pa`.
    pub fn read(&self, pa: PhysicalAddress, size: usize, cpu_id: usize) -> Result<u64, MemoryFault> {
        let (index, tag) = self.geometry(pa);
        let offset = (pa.as_u64() & (self.line_size as u64 - 1)) as usize;
        self.sets[index].with_lock(|ways, hand| {
            let way = match set::find(ways, tag) {
                Some(w) => {
                    self.stats.hits.incr();
                    w
                }
                None => self.evict_and_fill(ways, hand, index, tag, cpu_id, false)?,
            };
            ways[way].last_access = self.next_stamp();
            ways[way].referenced = true;
            let mut buf = [0u8; 8];
            buf[..size].copy_from_slice(&ways[way].data[offset..offset + size]);
            Ok(u64::from_le_bytes(buf))
        })
    }

    /// Write `size` bytes of `value` at `pa`.
    pub fn write(&self, pa: PhysicalAddress, size: usize, value: u64, cpu_id: usize) -> Result<(), MemoryFault> {
        let (index, tag) = self.geometry(pa);
        let line_key = self.line_key(index, tag);
        let offset = (pa.as_u64() & (self.line_size as u64 - 1)) as usize;
        self.sets[index].with_lock(|ways, hand| {
            let way = match set::find(ways, tag) {
                Some(w) => {
                    self.stats.hits.incr();
                    match ways[w].state {
                        MesiState::Modified | MesiState::Exclusive => ways[w].state = MesiState::Modified,
                        MesiState::Shared | MesiState::Invalid => {
                            self.claim_exclusive(line_key, cpu_id);
                            ways[w].state = MesiState::Modified;
                        }
                    }
                    w
                }
                None => self.evict_and_fill(ways, hand, index, tag, cpu_id, true)?,
            };
            ways[way].last_access = self.next_stamp();
            ways[way].referenced = true;
            let le = value.to_le_bytes();
            ways[way].data[offset..offset + size].copy_from_slice(&le[..size]);
            if self.write_policy == WritePolicy::WriteThrough {
                let line_pa = PhysicalAddress::new(line_key);
                self.next.write_line(line_pa, &ways[way].data, cpu_id)?;
            }
            Ok(())
        })
    }

    /// Drop this cache's copy of `pa`'s line, if present, without writing it back.
    pub fn invalidate(&self, pa: PhysicalAddress) {
        let (index, tag) = self.geometry(pa);
        let line_key = self.line_key(index, tag);
        self.sets[index].with_lock(|ways, _hand| {
            if let Some(w) = set::find(ways, tag) {
                ways[w].invalidate();
                self.stats.invalidations.incr();
                if let Some(dir) = &self.directory {
                    dir.forget(self.id, line_key);
                }
            }
        });
    }

    pub fn invalidate_all(&self) {
        for (index, set) in self.sets.iter().enumerate() {
            set.with_lock(|ways, _hand| {
                for way in ways.iter_mut() {
                    if way.is_valid() {
                        if let Some(dir) = &self.directory {
                            dir.forget(self.id, self.line_key(index, way.tag));
                        }
                        way.invalidate();
                        self.stats.invalidations.incr();
                    }
                }
            });
        }
    }

    /// Write back `pa`'s line if dirty, keeping it cached.
    pub fn flush(&self, pa: PhysicalAddress, cpu_id: usize) -> Result<(), MemoryFault> {
        let (index, tag) = self.geometry(pa);
        let line_key = self.line_key(index, tag);
        self.sets[index].with_lock(|ways, _hand| {
            if let Some(w) = set::find(ways, tag) {
                if ways[w].is_dirty() {
                    self.next
                        .write_line(PhysicalAddress::new(line_key), &ways[w].data, cpu_id)
                        .map_err(|_| self.machine_check(PhysicalAddress::new(line_key), cpu_id))?;
                    self.stats.write_backs.incr();
                }
            }
            Ok(())
        })
    }

    pub fn flush_all(&self, cpu_id: usize) -> Result<(), MemoryFault> {
        for index in 0..self.sets.len() {
            let tags: Vec<u64> = self.sets[index].with_lock(|ways, _hand| {
                ways.iter().filter(|w| w.is_dirty()).map(|w| w.tag).collect()
            });
            for tag in tags {
                let line_key = self.line_key(index, tag);
                self.flush(PhysicalAddress::new(line_key), cpu_id)?;
            }
        }
        Ok(())
    }

    /// Bring `pa`'s line into this cache without disturbing its contents, for `FETCH`/`FETCH_M`
    /// (§4.9). `want_exclusive` requests `Modified` ownership the way a write would, but unlike
    /// `write` never mutates the line's bytes.
    pub fn prefetch(&self, pa: PhysicalAddress, cpu_id: usize, want_exclusive: bool) -> Result<(), MemoryFault> {
        let (index, tag) = self.geometry(pa);
        self.sets[index].with_lock(|ways, hand| {
            let way = match set::find(ways, tag) {
                Some(w) => w,
                None => self.evict_and_fill(ways, hand, index, tag, cpu_id, want_exclusive)?,
            };
            ways[way].last_access = self.next_stamp();
            ways[way].referenced = true;
            Ok(())
        })
    }

    /// Respond to a coherence snoop directly (tests call this without going through the bus).
    pub fn snoop(&self, pa: PhysicalAddress, op: CoherenceOp, cpu_id: usize) {
        let (index, tag) = self.geometry(pa);
        let line_key = self.line_key(index, tag);
        let result: Result<(), MemoryFault> = self.sets[index].with_lock(|ways, _hand| {
            let Some(w) = set::find(ways, tag) else { return Ok(()) };
            match op {
                CoherenceOp::Invalidate => {
                    if ways[w].is_dirty() {
                        self.next
                            .write_line(PhysicalAddress::new(line_key), &ways[w].data, cpu_id)
                            .map_err(|_| self.machine_check(PhysicalAddress::new(line_key), cpu_id))?;
                        self.stats.write_backs.incr();
                    }
                    ways[w].invalidate();
                    self.stats.invalidations.incr();
                    if let Some(dir) = &self.directory {
                        dir.forget(self.id, line_key);
                    }
                }
                CoherenceOp::DowngradeToShared => {
                    if ways[w].is_dirty() {
                        self.next
                            .write_line(PhysicalAddress::new(line_key), &ways[w].data, cpu_id)
                            .map_err(|_| self.machine_check(PhysicalAddress::new(line_key), cpu_id))?;
                        self.stats.write_backs.incr();
                    }
                    ways[w].state = MesiState::Shared;
                }
                CoherenceOp::WriteBack => {
                    if ways[w].is_dirty() {
                        self.next
                            .write_line(PhysicalAddress::new(line_key), &ways[w].data, cpu_id)
                            .map_err(|_| self.machine_check(PhysicalAddress::new(line_key), cpu_id))?;
                        self.stats.write_backs.incr();
                    }
                }
            }
            Ok(())
        });
        if let Err(fault) = result {
            warn!(cache = self.name, ?fault, "snoop handling failed, line left invalid");
        }
    }
}

impl CoherenceSubscriber for Cache {
    fn on_coherence_event(&self, event: CoherenceEvent) {
        if self.owner_cpu == Some(event.source_cpu) {
            return;
        }
        self.snoop(event.line_address, event.op, event.source_cpu);
    }
}
