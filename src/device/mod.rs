//! Memory-mapped device model.
//!
//! Every peripheral implements [`Device`]: read/write handlers over
//! base-relative addresses, an optional tick callback, and a cycle-threshold
//! sync gate that keeps real-time peripherals coherent with virtual CPU time
//! without per-instruction overhead.
//!
//! Devices are shared between the CPU thread and the input-producing threads
//! (command loop, display pump), so each device guards its own state with a
//! mutex or atomics and the trait takes `&self`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cpu::{FaultKind, MemAccess, MemResponse};

pub mod display;
pub mod memory;
pub mod timer;
pub mod uart;

pub use display::{DisplayDevice, PresentationSurface, SurfaceEvent};
pub use memory::MemoryDevice;
pub use timer::TimerDevice;
pub use uart::UartDevice;

/// Default minimum cycles between tick deliveries to a device.
pub const DEFAULT_SYNC_THRESHOLD: u64 = 128;

/// Coarse device classification, used by the host wiring and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ram,
    Rom,
    Display,
    Timer,
    Uart,
    Other,
}

/// Cycle-threshold bookkeeping for [`Device::sync`].
///
/// The threshold starts at [`DEFAULT_SYNC_THRESHOLD`] and is recomputed at
/// wiring time for devices that declare an update frequency.
#[derive(Debug)]
pub struct SyncState {
    threshold: AtomicU64,
    last_sync: AtomicU64,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            threshold: AtomicU64::new(DEFAULT_SYNC_THRESHOLD),
            last_sync: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn set_threshold(&self, cycles: u64) {
        self.threshold.store(cycles.max(1), Ordering::Relaxed);
    }

    pub fn last_sync(&self) -> u64 {
        self.last_sync.load(Ordering::Acquire)
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Common contract for memory-mapped devices.
///
/// Addresses in [`MemAccess`] are base-relative: the bus translates before
/// forwarding. The default read/write handlers report a `DeviceFault`, which
/// models a device without a handler for that direction.
pub trait Device: Send + Sync {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Other
    }

    fn read(&self, access: &MemAccess) -> MemResponse {
        MemResponse::fault(FaultKind::DeviceFault, access)
    }

    fn write(&self, access: &MemAccess) -> MemResponse {
        MemResponse::fault(FaultKind::DeviceFault, access)
    }

    /// Deliver `delta_cycles` of virtual time to the device.
    fn tick(&self, _delta_cycles: u64) {}

    /// Whether [`Device::tick`] does anything; gates the sync path.
    fn has_tick(&self) -> bool {
        false
    }

    /// Desired tick rate in Hz; 0 means the device does not care.
    fn update_frequency(&self) -> u32 {
        0
    }

    fn sync_state(&self) -> &SyncState;

    /// Deliver a tick iff the cycle counter advanced past the threshold
    /// since the last delivery. No-op for devices without a tick handler.
    fn sync(&self, current_cycle: u64) {
        if !self.has_tick() {
            return;
        }
        let state = self.sync_state();
        let last = state.last_sync.load(Ordering::Acquire);
        if current_cycle <= last {
            return;
        }
        let delta = current_cycle - last;
        if delta < state.threshold.load(Ordering::Relaxed) {
            return;
        }
        self.tick(delta);
        state.last_sync.store(current_cycle, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingDevice {
        sync: SyncState,
        ticked: AtomicU64,
    }

    impl CountingDevice {
        fn new() -> Self {
            Self { sync: SyncState::new(), ticked: AtomicU64::new(0) }
        }
    }

    impl Device for CountingDevice {
        fn tick(&self, delta_cycles: u64) {
            self.ticked.fetch_add(delta_cycles, Ordering::Relaxed);
        }

        fn has_tick(&self) -> bool {
            true
        }

        fn sync_state(&self) -> &SyncState {
            &self.sync
        }
    }

    struct InertDevice {
        sync: SyncState,
    }

    impl Device for InertDevice {
        fn sync_state(&self) -> &SyncState {
            &self.sync
        }
    }

    #[test]
    fn sync_waits_for_threshold() {
        let dev = CountingDevice::new();
        dev.sync.set_threshold(100);

        dev.sync(50);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 0);

        dev.sync(99);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 0);

        dev.sync(100);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 100);
        assert_eq!(dev.sync.last_sync(), 100);

        // Threshold is measured from the last delivery, not from zero.
        dev.sync(150);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 100);
        dev.sync(200);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn sync_ignores_stale_cycles() {
        let dev = CountingDevice::new();
        dev.sync.set_threshold(10);
        dev.sync(50);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 50);
        dev.sync(50);
        dev.sync(40);
        assert_eq!(dev.ticked.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn sync_is_noop_without_tick_handler() {
        let dev = InertDevice { sync: SyncState::new() };
        dev.sync(1_000_000);
        assert_eq!(dev.sync.last_sync(), 0);
    }

    #[test]
    fn default_handlers_report_device_fault() {
        let dev = InertDevice { sync: SyncState::new() };
        let access = MemAccess::read(0, 4);
        let resp = dev.read(&access);
        assert!(!resp.ok);
        assert_eq!(resp.error.kind, FaultKind::DeviceFault);
        let resp = dev.write(&MemAccess::write(0, 4, 1));
        assert_eq!(resp.error.kind, FaultKind::DeviceFault);
    }

    #[test]
    fn threshold_floor_is_one_cycle() {
        let state = SyncState::new();
        state.set_threshold(0);
        assert_eq!(state.threshold(), 1);
    }
}
