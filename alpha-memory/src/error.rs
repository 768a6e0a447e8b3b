//! Typed fault and configuration error taxonomy.
//!
//! Every fault that can be observed by a caller of [`crate::MemorySystem`] is a variant of
//! [`MemoryFault`]. Faults are data, not panics: the caller's state machine decides whether to
//! retry (as `MemorySystem` itself does for `TlbMiss`) or surface the condition further up.

use {
    crate::addr::{AccessType, PhysicalAddress, VirtualAddress},
    snafu::Snafu,
};

/// Which memory-hierarchy stage raised a fault, kept for statistics and logging.
pub type CpuId = usize;

/// Everything a caller needs to diagnose a fault, attached to every [`MemoryFault`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    /// The virtual address the access was issued against.
    pub virtual_address: VirtualAddress,
    /// The resolved physical address, if translation had already succeeded.
    pub physical_address: Option<PhysicalAddress>,
    /// Read, Write or Execute.
    pub access_type: AccessType,
    /// The emulated CPU that triggered the fault.
    pub cpu_id: CpuId,
    /// Program counter of the faulting instruction, when known to the caller.
    pub pc: u64,
}

impl FaultContext {
    /// Convenience constructor for faults raised before a physical address is known.
    pub fn new(virtual_address: VirtualAddress, access_type: AccessType, cpu_id: CpuId, pc: u64) -> Self {
        Self {
            virtual_address,
            physical_address: None,
            access_type,
            cpu_id,
            pc,
        }
    }

    /// Attach a resolved physical address.
    pub fn with_physical(mut self, pa: PhysicalAddress) -> Self {
        self.physical_address = Some(pa);
        self
    }
}

/// Faults surfaced by the memory subsystem, per §7 of the design.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// Misaligned access when unaligned-access mode is disabled.
    #[snafu(display("alignment fault: va={:#x} size={} cpu={}", ctx.virtual_address.0, size, ctx.cpu_id))]
    AlignmentFault { ctx: FaultContext, size: usize },

    /// Translation not cached; resolved internally by a page-table walk and retried once.
    #[snafu(display("tlb miss: va={:#x} cpu={}", ctx.virtual_address.0, ctx.cpu_id))]
    TlbMiss { ctx: FaultContext },

    /// No valid translation exists for the virtual address.
    #[snafu(display("page fault: va={:#x} cpu={}", ctx.virtual_address.0, ctx.cpu_id))]
    PageFault { ctx: FaultContext },

    /// The PTE denies the requested access (read/write/execute, or kernel-only).
    #[snafu(display("protection fault: va={:#x} access={:?} cpu={}", ctx.virtual_address.0, ctx.access_type, ctx.cpu_id))]
    ProtectionFault { ctx: FaultContext },

    /// Physical access beyond the bus map (neither RAM nor a registered device window).
    #[snafu(display("access violation: pa={:?} cpu={}", ctx.physical_address, ctx.cpu_id))]
    AccessViolation { ctx: FaultContext },

    /// Backing-store or coherence-ACK failure, or a bus protocol error.
    #[snafu(display("machine check: pa={:?} cpu={}", ctx.physical_address, ctx.cpu_id))]
    MachineCheck { ctx: FaultContext },

    /// `store-conditional` found its reservation invalid.
    #[snafu(display("reservation lost: pa={:?} cpu={}", ctx.physical_address, ctx.cpu_id))]
    ReservationLost { ctx: FaultContext },

    /// SMP barrier coordination exceeded its deadline.
    #[snafu(display("barrier timeout: cpu={}", ctx.cpu_id))]
    BarrierTimeout { ctx: FaultContext },
}

impl MemoryFault {
    /// The fault context common to every variant.
    pub fn context(&self) -> &FaultContext {
        match self {
            MemoryFault::AlignmentFault { ctx, .. }
            | MemoryFault::TlbMiss { ctx }
            | MemoryFault::PageFault { ctx }
            | MemoryFault::ProtectionFault { ctx }
            | MemoryFault::AccessViolation { ctx }
            | MemoryFault::MachineCheck { ctx }
            | MemoryFault::ReservationLost { ctx }
            | MemoryFault::BarrierTimeout { ctx } => ctx,
        }
    }

    /// Whether this fault kind is fatal to the current instruction only, as opposed to
    /// recoverable internally (only `TlbMiss` is resolved without caller involvement).
    pub fn is_recoverable_internally(&self) -> bool {
        matches!(self, MemoryFault::TlbMiss { .. })
    }
}

/// Errors raised while validating or loading a [`crate::config::Config`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The configuration source could not be parsed as TOML.
    #[snafu(display("failed to parse configuration: {}", source))]
    Parse { source: toml::de::Error },

    /// `memory.size_gb` was below the architectural minimum of 4 GiB.
    #[snafu(display("memory.size_gb = {} is below the minimum of 4", size_gb))]
    MemoryTooSmall { size_gb: u64 },

    /// A cache geometry field was not a power of two.
    #[snafu(display("{} = {} is not a power of two", field, value))]
    NotPowerOfTwo { field: &'static str, value: usize },

    /// A cache's associativity fell outside the supported 2..=32 range.
    #[snafu(display("{} associativity {} is outside the supported 2..=32 range", field, value))]
    InvalidAssociativity { field: &'static str, value: usize },

    /// `cpu.count` was zero.
    #[snafu(display("cpu.count must be at least 1"))]
    NoCpus,

    /// Two MMIO windows overlap in physical address space.
    #[snafu(display("mmio window {:#x}..{:#x} overlaps {:#x}..{:#x}", a_base, a_end, b_base, b_end))]
    OverlappingWindows {
        a_base: u64,
        a_end: u64,
        b_base: u64,
        b_end: u64,
    },
}
