//! A DEC Alpha AXP SMP memory subsystem: page tables, split TLBs, a MESI cache hierarchy,
//! load-locked/store-conditional reservations and the SMP barrier primitives, wired up behind
//! one [`MemorySystem`] front door.
//!
//! The embedding emulator supplies the pieces outside this crate's scope: the CPU core that
//! decodes instructions and implements [`ExecutionContext`], and any device models registered
//! into a [`MmioRouter`].

pub mod addr;
pub mod barrier;
pub mod cache;
pub mod coherence;
pub mod config;
pub mod context;
pub mod error;
pub mod memory_system;
pub mod physical;
pub mod pte;
pub mod reservation;
pub mod stats;
pub mod tlb;
pub mod walker;

pub use addr::{AccessType, Asn, Granularity, Mode, PhysicalAddress, VirtualAddress};
pub use barrier::BarrierKind;
pub use config::Config;
pub use context::{ExecutionContext, PalEntry, PalFunctionCode, PalRegistry};
pub use error::{ConfigError, FaultContext, MemoryFault};
pub use memory_system::MemorySystem;
pub use physical::{DeviceAccess, MmioRouter, MmioWindow};
