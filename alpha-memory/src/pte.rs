//! Page Table Entry encoding.
//!
//! A PTE packs into a single 64-bit word read straight off [`crate::physical::PhysicalBus`].
//! Field layout (LSB first): `valid(1) fault_on_read(1) fault_on_write(1) fault_on_execute(1)
//! asm_bit(1) granularity(2) pfn(32) software(16)`.
//!
//! `software` is architecturally opaque; this implementation reserves its bit 0 as the
//! kernel-only flag referenced by §4.6 (`ProtectionFault` on user-mode access to a kernel-only
//! page). The source spec enumerates PTE fields without a dedicated privilege bit, so this is a
//! recorded design decision rather than an architectural fact — see DESIGN.md.

use {
    crate::addr::Granularity,
    bit_field::BitField,
};

const VALID_BIT: usize = 0;
const FAULT_ON_READ_BIT: usize = 1;
const FAULT_ON_WRITE_BIT: usize = 2;
const FAULT_ON_EXECUTE_BIT: usize = 3;
const ASM_BIT: usize = 4;
const GRANULARITY_RANGE: core::ops::Range<usize> = 5..7;
const PFN_RANGE: core::ops::Range<usize> = 7..39;
const SOFTWARE_RANGE: core::ops::Range<usize> = 39..55;

/// Bit 0 of the `software` field: page is only accessible in [`crate::addr::Mode::Kernel`].
const KERNEL_ONLY_BIT: usize = 0;

/// A decoded Page Table Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    pub valid: bool,
    pub fault_on_read: bool,
    pub fault_on_write: bool,
    pub fault_on_execute: bool,
    pub asm_bit: bool,
    pub granularity: RawGranularity,
    /// Page-frame number, always in 8-KiB units regardless of `granularity`.
    pub pfn: u32,
    pub software: u16,
}

/// Thin wrapper so `PageTableEntry` can `#[derive(Default)]` while `Granularity` has no
/// natural zero variant ordering guarantee beyond `Base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawGranularity(pub Granularity);

impl Default for RawGranularity {
    fn default() -> Self {
        RawGranularity(Granularity::Base)
    }
}

impl PageTableEntry {
    /// Decode a PTE from its raw 64-bit representation.
    pub fn from_raw(raw: u64) -> Self {
        let valid = raw.get_bit(VALID_BIT);
        Self {
            valid,
            fault_on_read: raw.get_bit(FAULT_ON_READ_BIT),
            fault_on_write: raw.get_bit(FAULT_ON_WRITE_BIT),
            fault_on_execute: raw.get_bit(FAULT_ON_EXECUTE_BIT),
            asm_bit: raw.get_bit(ASM_BIT),
            granularity: RawGranularity(Granularity::from_bits(
                raw.get_bits(GRANULARITY_RANGE) as u8,
            )),
            pfn: raw.get_bits(PFN_RANGE) as u32,
            software: raw.get_bits(SOFTWARE_RANGE) as u16,
        }
    }

    /// Encode back into the raw 64-bit representation.
    pub fn to_raw(self) -> u64 {
        let mut raw = 0u64;
        raw.set_bit(VALID_BIT, self.valid);
        raw.set_bit(FAULT_ON_READ_BIT, self.fault_on_read);
        raw.set_bit(FAULT_ON_WRITE_BIT, self.fault_on_write);
        raw.set_bit(FAULT_ON_EXECUTE_BIT, self.fault_on_execute);
        raw.set_bit(ASM_BIT, self.asm_bit);
        raw.set_bits(GRANULARITY_RANGE, self.granularity.0.bits() as u64);
        raw.set_bits(PFN_RANGE, self.pfn as u64);
        raw.set_bits(SOFTWARE_RANGE, self.software as u64);
        raw
    }

    /// Whether this page is restricted to kernel mode (§4.6).
    pub fn kernel_only(&self) -> bool {
        self.software.get_bit(KERNEL_ONLY_BIT)
    }

    pub fn set_kernel_only(&mut self, kernel_only: bool) {
        self.software.set_bit(KERNEL_ONLY_BIT, kernel_only);
    }

    /// Base physical address of the page this PTE maps, in bytes.
    pub fn physical_base(&self) -> u64 {
        (self.pfn as u64) << crate::addr::PAGE_SHIFT
    }
}
