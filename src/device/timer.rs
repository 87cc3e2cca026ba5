//! Monotonic microsecond timer advanced by CPU cycles.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cpu::{FaultKind, MemAccess, MemResponse};
use crate::device::{Device, DeviceKind, SyncState};

const REG_LOW: u64 = 0x0;
const REG_HIGH: u64 = 0x4;
const REG_CTRL: u64 = 0x8;
const REG_SIZE: u32 = 4;

/// Virtual-clock timer.
///
/// The counter advances only through tick deliveries: one cycle is one
/// microsecond by construction (the core is modeled at 1 MHz; hosts wanting
/// true microseconds scale in a wrapper). Register map, 4-byte accesses:
/// `0x0 LOW` / `0x4 HIGH` read the counter halves, any `0x8 CTRL` write
/// resets the counter. Everything else faults.
pub struct TimerDevice {
    micros: AtomicU64,
    sync: SyncState,
}

impl TimerDevice {
    pub fn new() -> Self {
        Self { micros: AtomicU64::new(0), sync: SyncState::new() }
    }

    pub fn micros(&self) -> u64 {
        self.micros.load(Ordering::Acquire)
    }
}

impl Default for TimerDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for TimerDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Timer
    }

    fn read(&self, access: &MemAccess) -> MemResponse {
        if access.size != REG_SIZE {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        let counter = self.micros.load(Ordering::Acquire);
        match access.address {
            REG_LOW => MemResponse::success(counter & 0xffff_ffff),
            REG_HIGH => MemResponse::success(counter >> 32),
            _ => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    fn write(&self, access: &MemAccess) -> MemResponse {
        if access.size != REG_SIZE {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        match access.address {
            REG_CTRL => {
                self.micros.store(0, Ordering::Release);
                MemResponse::success(0)
            }
            _ => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    fn tick(&self, delta_cycles: u64) {
        self.micros.fetch_add(delta_cycles, Ordering::AcqRel);
    }

    fn has_tick(&self) -> bool {
        true
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }
}
