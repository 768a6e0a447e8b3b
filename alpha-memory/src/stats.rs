//! Per-component statistics counters.
//!
//! Every stateful component owns one of these structs instead of reaching for global mutable
//! state (§9). Counters are plain atomics so `stats()` can return a consistent snapshot without
//! taking the component's data lock.

use core::sync::atomic::{AtomicU64, Ordering};

/// A single named counter, incremented from any thread without synchronization.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Hit/miss/fill/eviction/write-back counters for one cache level.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: Counter,
    pub misses: Counter,
    pub fills: Counter,
    pub evictions: Counter,
    pub write_backs: Counter,
    pub invalidations: Counter,
}

/// A read-only snapshot of [`CacheStats`], safe to hand out to callers and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.get(),
            misses: self.misses.get(),
            fills: self.fills.get(),
            evictions: self.evictions.get(),
            write_backs: self.write_backs.get(),
            invalidations: self.invalidations.get(),
        }
    }
}

/// Lookup/insert/invalidate counters for one TLB (instruction or data).
#[derive(Debug, Default)]
pub struct TlbStats {
    pub hits: Counter,
    pub misses: Counter,
    pub insertions: Counter,
    pub invalidations: Counter,
}

/// Barrier completion counters.
#[derive(Debug, Default)]
pub struct BarrierStats {
    pub completed: Counter,
    pub timed_out: Counter,
}

/// Top-level counters owned by [`crate::memory_system::MemorySystem`].
#[derive(Debug, Default)]
pub struct MemorySystemStats {
    pub reads: Counter,
    pub writes: Counter,
    pub page_table_walks: Counter,
    pub faults: Counter,
    pub load_locked: Counter,
    pub store_conditional_success: Counter,
    pub store_conditional_failure: Counter,
}
