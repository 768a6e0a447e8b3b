//! Physical memory: backing RAM, MMIO device windows, and the bus that dispatches between them.

pub mod bus;
pub mod mmio;
pub mod store;

pub use bus::PhysicalBus;
pub use mmio::{DeviceAccess, MmioRouter, MmioWindow};
pub use store::PhysicalStore;
