//! `load-locked`/`store-conditional` reservations, per §4.8.

use {
    crate::{addr::PhysicalAddress, coherence::CoherenceEvent},
    std::sync::Mutex,
};

#[derive(Debug, Clone, Copy)]
struct Reservation {
    pa: PhysicalAddress,
    size: usize,
}

/// Tracks at most one live reservation per CPU. A coherent write to any line overlapping a
/// reservation invalidates it, which is why [`ReservationTable`] subscribes to the
/// [`crate::coherence::CoherenceBus`] directly rather than being told about writes by its owner.
pub struct ReservationTable {
    reservations: Mutex<Vec<Option<Reservation>>>,
}

impl ReservationTable {
    pub fn new(num_cpus: usize) -> Self {
        Self { reservations: Mutex::new(vec![None; num_cpus]) }
    }

    /// Record a reservation for `cpu_id`, replacing any prior one.
    pub fn set(&self, cpu_id: usize, pa: PhysicalAddress, size: usize) {
        self.reservations.lock().unwrap()[cpu_id] = Some(Reservation { pa, size });
    }

    /// Whether `cpu_id` still holds a valid reservation covering `pa`/`size`.
    pub fn check(&self, cpu_id: usize, pa: PhysicalAddress, size: usize) -> bool {
        matches!(
            self.reservations.lock().unwrap()[cpu_id],
            Some(r) if overlaps(r.pa, r.size, pa, size)
        )
    }

    /// Drop `cpu_id`'s reservation, if any. Called after a `store_conditional` resolves either
    /// way, since the architecture allows at most one successful attempt per `load_locked`.
    pub fn clear_cpu(&self, cpu_id: usize) {
        self.reservations.lock().unwrap()[cpu_id] = None;
    }

    /// Drop any reservation (other than `except_cpu`'s) whose line overlaps `line_pa`/`size`.
    pub fn clear_overlapping(&self, line_pa: PhysicalAddress, size: usize, except_cpu: Option<usize>) {
        let mut reservations = self.reservations.lock().unwrap();
        for (cpu_id, slot) in reservations.iter_mut().enumerate() {
            if Some(cpu_id) == except_cpu {
                continue;
            }
            if let Some(r) = slot {
                if overlaps(r.pa, r.size, line_pa, size) {
                    *slot = None;
                }
            }
        }
    }
}

fn overlaps(a_pa: PhysicalAddress, a_size: usize, b_pa: PhysicalAddress, b_size: usize) -> bool {
    let (a_start, a_end) = (a_pa.as_u64(), a_pa.as_u64() + a_size as u64);
    let (b_start, b_end) = (b_pa.as_u64(), b_pa.as_u64() + b_size as u64);
    a_start < b_end && b_start < a_end
}

impl crate::coherence::CoherenceSubscriber for ReservationTable {
    fn on_coherence_event(&self, event: CoherenceEvent) {
        // Any coherent write, including the issuing CPU's own, invalidates a matching
        // reservation (§4.8): the architecture does not exempt self-writes from clearing `LL`.
        self.clear_overlapping(event.line_address, crate::addr::LINE_SIZE as usize, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_check_succeeds() {
        let table = ReservationTable::new(2);
        table.set(0, PhysicalAddress::new(0x2_0000), 8);
        assert!(table.check(0, PhysicalAddress::new(0x2_0000), 8));
    }

    #[test]
    fn overlapping_write_from_another_cpu_invalidates() {
        let table = ReservationTable::new(2);
        table.set(0, PhysicalAddress::new(0x2_0000), 8);
        table.clear_overlapping(PhysicalAddress::new(0x2_0000).line_address(), 64, Some(1));
        assert!(!table.check(0, PhysicalAddress::new(0x2_0000), 8));
    }

    #[test]
    fn each_cpu_has_at_most_one_reservation() {
        let table = ReservationTable::new(1);
        table.set(0, PhysicalAddress::new(0x1000), 8);
        table.set(0, PhysicalAddress::new(0x2000), 8);
        assert!(!table.check(0, PhysicalAddress::new(0x1000), 8));
        assert!(table.check(0, PhysicalAddress::new(0x2000), 8));
    }
}
