//! Process-wide device slot table (§9 "Global device table").
//!
//! One slot per board address (0..7). The table itself only changes shape
//! during `open`/`close`: population on first open, reference-counted on
//! repeat opens, torn down on last close. Everything that happens *through*
//! an open handle (config reads/writes, scan start/stop, scan reads) goes
//! through the `Arc<Mutex<DeviceState>>` a slot hands out, not through the
//! table.

use std::sync::{Arc, Mutex, OnceLock};

use crate::device::DeviceState;

pub const SLOT_COUNT: usize = 8;

struct Slot {
    ref_count: u32,
    state: Arc<Mutex<DeviceState>>,
}

/// Lazily-initialized, fixed-size table of open device slots.
pub struct DeviceTable {
    slots: OnceLock<Mutex<[Option<Slot>; SLOT_COUNT]>>,
}

impl DeviceTable {
    pub const fn new() -> Self {
        DeviceTable {
            slots: OnceLock::new(),
        }
    }

    fn slots(&self) -> &Mutex<[Option<Slot>; SLOT_COUNT]> {
        self.slots.get_or_init(|| Mutex::new(Default::default()))
    }

    /// Returns the existing handle's state with its reference count bumped,
    /// or `None` if `address` has no open slot yet.
    pub fn acquire_existing(&self, address: u8) -> Option<Arc<Mutex<DeviceState>>> {
        let mut slots = self.slots().lock().unwrap();
        let slot = slots.get_mut(address as usize)?.as_mut()?;
        slot.ref_count += 1;
        Some(Arc::clone(&slot.state))
    }

    /// Populate an empty slot with a freshly-opened device's state. Panics
    /// (a programming error, not a runtime condition) if the slot is
    /// already populated — callers must check `acquire_existing` first
    /// under the same lock-free race window this table accepts by design.
    pub fn install(&self, address: u8, state: DeviceState) -> Arc<Mutex<DeviceState>> {
        let mut slots = self.slots().lock().unwrap();
        let arc = Arc::new(Mutex::new(state));
        slots[address as usize] = Some(Slot {
            ref_count: 1,
            state: Arc::clone(&arc),
        });
        arc
    }

    /// Decrement the slot's reference count; clear it entirely once it
    /// reaches zero. Returns `true` if this call cleared the slot.
    pub fn release(&self, address: u8) -> bool {
        let mut slots = self.slots().lock().unwrap();
        let Some(slot) = slots.get_mut(address as usize).and_then(|s| s.as_mut()) else {
            return false;
        };
        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            slots[address as usize] = None;
            true
        } else {
            false
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

static TABLE: DeviceTable = DeviceTable::new();

/// The single process-wide table. All `device::open`/`close` calls go
/// through this instance.
pub fn global() -> &'static DeviceTable {
    &TABLE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationStore;
    use crate::hal::mock::{MockBus, MockBusLock, MockBusMux, MockDeviceState, MockEeprom, MockGpio};
    use crate::hal::Collaborators;
    use std::sync::Mutex as StdMutex;

    fn fresh_state() -> DeviceState {
        let mock = Arc::new(StdMutex::new(MockDeviceState::default()));
        DeviceState::new(
            0,
            Collaborators {
                bus: Box::new(MockBus::new(mock)),
                lock: Box::new(MockBusLock::default()),
                mux: Box::new(MockBusMux::default()),
                gpio: Box::new(MockGpio::default()),
                eeprom: Box::new(MockEeprom::default()),
            },
            CalibrationStore::defaults(),
            0x0100,
        )
    }

    #[test]
    fn install_then_acquire_existing_bumps_ref_count() {
        let table = DeviceTable::new();
        assert!(table.acquire_existing(0).is_none());
        table.install(0, fresh_state());
        assert!(table.acquire_existing(0).is_some());
    }

    #[test]
    fn release_clears_slot_at_zero() {
        let table = DeviceTable::new();
        table.install(0, fresh_state()); // ref_count 1
        table.acquire_existing(0).unwrap(); // ref_count 2
        assert!(!table.release(0)); // ref_count 1, still open
        assert!(table.acquire_existing(0).is_some());
        assert!(!table.release(0)); // ref_count back to 1
        assert!(table.release(0)); // ref_count 0, slot cleared
        assert!(!table.release(0)); // already empty, no-op
    }
}
