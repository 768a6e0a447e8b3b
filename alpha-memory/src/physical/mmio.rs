//! Memory-mapped device windows: Dense, Sparse and CSR, per §4.2 and §6.

use {
    crate::{
        addr::PhysicalAddress,
        config::{MmioWindowConfig, WindowKind},
        error::ConfigError,
    },
    std::sync::{Arc, RwLock},
    tracing::debug,
};

/// A device model plugged in behind an MMIO window. Device models themselves are out of scope
/// for this crate (§1); this trait is the seam an embedder implements against.
pub trait DeviceAccess: Send + Sync {
    /// Read `size` bytes at `bus_addr` (already translated from the physical address).
    fn read(&self, bus_addr: u64, size: usize) -> u64;
    /// Write `size` bytes of `value` at `bus_addr`.
    fn write(&self, bus_addr: u64, size: usize, value: u64);
}

/// A registered device window.
pub struct MmioWindow {
    pub kind: WindowKind,
    pub base: u64,
    pub size: u64,
    pub tag: String,
    pub handler: Arc<dyn DeviceAccess>,
}

impl MmioWindow {
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.as_u64();
        pa >= self.base && pa < self.base + self.size
    }

    /// Translate a physical address inside this window to a device-local bus address, per the
    /// window's kind. For `Sparse`, also returns the byte lane the access falls on, derived
    /// from bits of the shifted bus address (see module docs in [`crate::physical::mmio`] for
    /// why reads and writes share one lane field in this implementation).
    pub fn translate(&self, pa: PhysicalAddress) -> (u64, Option<u8>) {
        let offset = pa.as_u64() - self.base;
        match self.kind {
            WindowKind::Dense | WindowKind::Csr => (offset, None),
            WindowKind::Sparse => {
                const SPARSE_SHIFT: u32 = 3;
                let bus = offset >> SPARSE_SHIFT;
                let lane = ((bus >> SPARSE_SHIFT) & 0b11) as u8;
                (bus, Some(lane))
            }
        }
    }
}

/// Routes physical accesses within registered device windows, per §4.2.
pub struct MmioRouter {
    windows: RwLock<Vec<MmioWindow>>,
}

impl Default for MmioRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioRouter {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(Vec::new()),
        }
    }

    /// Register a window. Overlapping windows are rejected.
    pub fn register(&self, window: MmioWindow) -> Result<(), ConfigError> {
        let mut windows = self.windows.write().unwrap();
        for existing in windows.iter() {
            let overlap = window.base < existing.base + existing.size && existing.base < window.base + window.size;
            if overlap {
                return Err(ConfigError::OverlappingWindows {
                    a_base: existing.base,
                    a_end: existing.base + existing.size,
                    b_base: window.base,
                    b_end: window.base + window.size,
                });
            }
        }
        windows.push(window);
        Ok(())
    }

    /// Construct and register a window from a `Config` entry, backed by `handler`.
    pub fn register_from_config(&self, config: &MmioWindowConfig, handler: Arc<dyn DeviceAccess>) -> Result<(), ConfigError> {
        self.register(MmioWindow {
            kind: config.kind,
            base: config.base,
            size: config.size,
            tag: config.tag.clone(),
            handler,
        })
    }

    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.windows.read().unwrap().iter().any(|w| w.contains(pa))
    }

    /// Dispatch a read. Returns `u64::MAX` (all-ones) when no window covers `pa`, matching
    /// hardware-faithful no-window read behavior (§4.2).
    pub fn read(&self, pa: PhysicalAddress, size: usize, cpu_id: usize) -> u64 {
        let windows = self.windows.read().unwrap();
        match windows.iter().find(|w| w.contains(pa)) {
            Some(window) => {
                let (bus_addr, lane) = window.translate(pa);
                debug!(tag = %window.tag, bus_addr, ?lane, cpu_id, "mmio read");
                window.handler.read(bus_addr, size)
            }
            None => {
                let mask = if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
                debug!(pa = ?pa, cpu_id, "mmio read: no window, returning all-ones");
                mask
            }
        }
    }

    /// Dispatch a write. A write to an unmapped address is silently dropped (§4.2).
    pub fn write(&self, pa: PhysicalAddress, size: usize, value: u64, cpu_id: usize) {
        let windows = self.windows.read().unwrap();
        match windows.iter().find(|w| w.contains(pa)) {
            Some(window) => {
                let (bus_addr, lane) = window.translate(pa);
                debug!(tag = %window.tag, bus_addr, ?lane, cpu_id, "mmio write");
                window.handler.write(bus_addr, size, value);
            }
            None => {
                debug!(pa = ?pa, cpu_id, "mmio write: no window, dropped");
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingDevice {
        last_bus_addr: AtomicU64,
        last_value: AtomicU64,
    }

    impl RecordingDevice {
        fn new() -> Self {
            Self { last_bus_addr: AtomicU64::new(0), last_value: AtomicU64::new(0) }
        }
    }

    impl DeviceAccess for RecordingDevice {
        fn read(&self, _bus_addr: u64, _size: usize) -> u64 {
            self.last_value.load(Ordering::Relaxed)
        }

        fn write(&self, bus_addr: u64, _size: usize, value: u64) {
            self.last_bus_addr.store(bus_addr, Ordering::Relaxed);
            self.last_value.store(value, Ordering::Relaxed);
        }
    }

    #[test]
    fn sparse_window_lane_and_bus_address() {
        let router = MmioRouter::new();
        let device = Arc::new(RecordingDevice::new());
        router
            .register(MmioWindow {
                kind: WindowKind::Sparse,
                base: 0x8040_0000_0000,
                size: 0x1_0000,
                tag: "sparse0".into(),
                handler: device.clone(),
            })
            .unwrap();

        let pa = PhysicalAddress::new(0x8040_0000_0000 + 0x80);
        router.write(pa, 1, 0x42, 0);
        assert_eq!(device.last_bus_addr.load(Ordering::Relaxed), 0x10);
        assert_eq!(device.last_value.load(Ordering::Relaxed), 0x42);

        let read_back = router.read(pa, 1, 0);
        assert_eq!(read_back, 0x42);
    }

    #[test]
    fn read_from_unmapped_address_is_all_ones() {
        let router = MmioRouter::new();
        assert_eq!(router.read(PhysicalAddress::new(0x9000_0000), 1, 0), 0xFF);
        assert_eq!(router.read(PhysicalAddress::new(0x9000_0000), 4, 0), 0xFFFF_FFFF);
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let router = MmioRouter::new();
        let device = Arc::new(RecordingDevice::new());
        router
            .register(MmioWindow { kind: WindowKind::Dense, base: 0x1000, size: 0x100, tag: "a".into(), handler: device.clone() })
            .unwrap();
        let result = router.register(MmioWindow { kind: WindowKind::Dense, base: 0x1080, size: 0x100, tag: "b".into(), handler: device });
        assert!(result.is_err());
    }
}
