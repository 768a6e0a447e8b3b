//! Inbound seams the core consumes but does not implement: the emulator's own per-CPU execution
//! state and its PAL function-code dispatch table, per §6.

use crate::addr::{Asn, Mode, PhysicalAddress};

/// Per-CPU state the memory subsystem reads to resolve an access; implemented by the embedding
/// emulator's CPU core, not by this crate.
pub trait ExecutionContext: Send + Sync {
    fn cpu_id(&self) -> usize;
    fn current_asn(&self) -> Asn;
    fn mode(&self) -> Mode;
    fn mmu_enabled(&self) -> bool;
    /// Page-table base register: root of the three-level walk for this CPU's current context.
    fn ptbr(&self) -> PhysicalAddress;
    /// Whether unaligned accesses are tolerated rather than faulting.
    fn unaligned_access_allowed(&self) -> bool;
}

/// A PAL (privileged architecture library) function code, as used by `RPCC`/`RS`/`RC` (§4.9).
pub type PalFunctionCode = u32;

/// One PAL entry point: a register-level operation with no direct memory effect, dispatched by
/// function code rather than by address.
pub trait PalEntry: Send + Sync {
    fn invoke(&self, cpu_id: usize) -> u64;
}

/// Maps PAL function codes to their handlers. Registration happens once, at construction, per
/// §9's "no runtime type tests" design note.
#[derive(Default)]
pub struct PalRegistry {
    entries: std::collections::HashMap<PalFunctionCode, std::sync::Arc<dyn PalEntry>>,
}

impl PalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: PalFunctionCode, entry: std::sync::Arc<dyn PalEntry>) {
        self.entries.insert(code, entry);
    }

    pub fn invoke(&self, code: PalFunctionCode, cpu_id: usize) -> Option<u64> {
        self.entries.get(&code).map(|entry| entry.invoke(cpu_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Rpcc;
    impl PalEntry for Rpcc {
        fn invoke(&self, _cpu_id: usize) -> u64 {
            42
        }
    }

    #[test]
    fn registered_entry_is_dispatched_by_code() {
        let mut registry = PalRegistry::new();
        registry.register(0x01, Arc::new(Rpcc));
        assert_eq!(registry.invoke(0x01, 0), Some(42));
        assert_eq!(registry.invoke(0x02, 0), None);
    }
}
