//! Per-CPU, split instruction/data TLBs with clock-with-reference replacement, per §4.7.

use {
    crate::{
        addr::{AccessType, Asn, Granularity, VirtualAddress},
        stats::TlbStats,
        walker::Translation,
    },
    std::sync::Mutex,
};

/// One cached translation.
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    valid: bool,
    /// Start address of this entry's granularity window (i.e. `va` masked to the window size).
    window_base: u64,
    granularity: Granularity,
    asn: Asn,
    global: bool,
    /// Physical base of this entry's window (i.e. the resolved `pa` masked to the window size).
    pa_window_base: u64,
    readable: bool,
    writable: bool,
    executable: bool,
    referenced: bool,
    dirty: bool,
}

impl TlbEntry {
    fn empty() -> Self {
        Self {
            valid: false,
            window_base: 0,
            granularity: Granularity::Base,
            asn: 0,
            global: false,
            pa_window_base: 0,
            readable: false,
            writable: false,
            executable: false,
            referenced: false,
            dirty: false,
        }
    }

    /// Whether this entry's page contains `va`, under its own granularity window.
    fn covers(&self, va: VirtualAddress, asn: Asn) -> bool {
        let window_mask = self.granularity.window_size() - 1;
        self.valid && (self.asn == asn || self.global) && (va.as_u64() & !window_mask) == self.window_base
    }
}

/// Outcome of a TLB lookup.
#[derive(Debug, Clone, Copy)]
pub struct TlbLookup {
    pub hit: bool,
    pub pa: Option<u64>,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// A single fixed-capacity, clock-replaced set of translations (used twice per CPU: once for
/// instruction fetches, once for data accesses).
pub struct Tlb {
    entries: Mutex<Vec<TlbEntry>>,
    clock_hand: Mutex<usize>,
    pub stats: TlbStats,
}

impl Tlb {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new((0..capacity).map(|_| TlbEntry::empty()).collect()),
            clock_hand: Mutex::new(0),
            stats: TlbStats::default(),
        }
    }

    /// Look up `va` under `asn`. On hit, marks the entry referenced, and dirty if this is a
    /// write.
    pub fn translate(&self, va: VirtualAddress, asn: Asn, access: AccessType) -> TlbLookup {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.covers(va, asn)) {
            Some(entry) => {
                self.stats.hits.incr();
                entry.referenced = true;
                if access == AccessType::Write {
                    entry.dirty = true;
                }
                let pa = entry.pa_window_base | va.offset_within(entry.granularity);
                TlbLookup { hit: true, pa: Some(pa), readable: entry.readable, writable: entry.writable, executable: entry.executable }
            }
            None => {
                self.stats.misses.incr();
                TlbLookup { hit: false, pa: None, readable: false, writable: false, executable: false }
            }
        }
    }

    /// Insert a freshly-walked translation, evicting via clock-with-reference if full.
    pub fn insert(&self, va: VirtualAddress, asn: Asn, global: bool, translation: Translation) {
        let mut entries = self.entries.lock().unwrap();
        let mut hand = self.clock_hand.lock().unwrap();
        let victim = loop {
            let candidate = *hand % entries.len();
            *hand = candidate + 1;
            if !entries[candidate].valid || !entries[candidate].referenced {
                break candidate;
            }
            entries[candidate].referenced = false;
        };
        let window_mask = translation.granularity.window_size() - 1;
        entries[victim] = TlbEntry {
            valid: true,
            window_base: va.as_u64() & !window_mask,
            granularity: translation.granularity,
            asn,
            global,
            pa_window_base: translation.pa.as_u64() & !window_mask,
            readable: translation.readable,
            writable: translation.writable,
            executable: translation.executable,
            referenced: true,
            dirty: false,
        };
        self.stats.insertions.incr();
    }

    pub fn invalidate_entry(&self, va: VirtualAddress, asn: Asn) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            let window_mask = entry.granularity.window_size() - 1;
            if entry.valid && entry.asn == asn && (va.as_u64() & !window_mask) == entry.window_base {
                *entry = TlbEntry::empty();
                self.stats.invalidations.incr();
            }
        }
    }

    pub fn invalidate_by_asn(&self, asn: Asn) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.valid && !entry.global && entry.asn == asn {
                *entry = TlbEntry::empty();
                self.stats.invalidations.incr();
            }
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.valid {
                *entry = TlbEntry::empty();
                self.stats.invalidations.incr();
            }
        }
    }
}

/// The pair of instruction/data TLBs owned by one CPU.
pub struct SplitTlb {
    pub instruction: Tlb,
    pub data: Tlb,
}

impl SplitTlb {
    pub fn new(i_entries: usize, d_entries: usize) -> Self {
        Self { instruction: Tlb::new(i_entries), data: Tlb::new(d_entries) }
    }

    /// Invalidate `va`/`asn` in both TLBs.
    pub fn invalidate_entry(&self, va: VirtualAddress, asn: Asn) {
        self.instruction.invalidate_entry(va, asn);
        self.data.invalidate_entry(va, asn);
    }

    pub fn invalidate_instruction(&self, va: VirtualAddress, asn: Asn) {
        self.instruction.invalidate_entry(va, asn);
    }

    pub fn invalidate_data(&self, va: VirtualAddress, asn: Asn) {
        self.data.invalidate_entry(va, asn);
    }

    pub fn invalidate_by_asn(&self, asn: Asn) {
        self.instruction.invalidate_by_asn(asn);
        self.data.invalidate_by_asn(asn);
    }

    pub fn invalidate_all(&self) {
        self.instruction.invalidate_all();
        self.data.invalidate_all();
    }
}
