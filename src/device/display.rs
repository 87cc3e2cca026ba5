//! Framebuffer + keyboard display device.
//!
//! The device maps a control/status/keyboard register block at `[0, 0x1000)`
//! followed by an ARGB8888 framebuffer. Rendering and input are delegated to
//! an abstract [`PresentationSurface`]; without one the device runs headless
//! and accepts everything while skipping the surface copy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::cpu::{FaultKind, MemAccess, MemResponse};
use crate::device::{Device, DeviceKind, SyncState};

/// Size of the register block preceding the framebuffer.
pub const CONTROL_REGION_SIZE: u64 = 0x1000;
/// Framebuffer offset within the mapped window.
pub const FRAMEBUFFER_OFFSET: u64 = CONTROL_REGION_SIZE;
/// Bytes per pixel (ARGB8888).
pub const BYTES_PER_PIXEL: u32 = 4;

const REG_CTRL: u64 = 0x00;
const REG_WIDTH: u64 = 0x04;
const REG_HEIGHT: u64 = 0x08;
const REG_PITCH: u64 = 0x0c;
const REG_STATUS: u64 = 0x10;
const REG_KEY_DATA: u64 = 0x20;
const REG_KEY_STATUS: u64 = 0x24;
const REG_KEY_LAST: u64 = 0x28;
const REG_SIZE: u32 = 4;

const CTRL_PRESENT: u64 = 1 << 0;
const STATUS_READY: u64 = 1 << 0;
const STATUS_DIRTY: u64 = 1 << 1;
const KEY_STATUS_READY: u64 = 1 << 0;

/// Event reported by a presentation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Key press, backend-specific key code.
    KeyDown(u32),
    /// The user asked to close the window.
    Quit,
}

/// Abstract window/renderer backend.
///
/// The concrete SDL binding lives outside this crate; tests use recording
/// fakes. `poll_event(0)` must not block.
pub trait PresentationSurface: Send {
    fn poll_event(&mut self, timeout_ms: u32) -> Option<SurfaceEvent>;
    fn present(&mut self, frame: &[u8], width: u32, height: u32, pitch: u32);
}

struct InputState {
    key_queue: VecDeque<u32>,
    last_key: u32,
    quit_requested: bool,
}

/// Memory-mapped display.
///
/// Control registers (4-byte accesses only):
/// - `0x00 CTRL` (W): bit0 requests a present.
/// - `0x04 WIDTH` / `0x08 HEIGHT` / `0x0C PITCH` (R).
/// - `0x10 STATUS` (R): bit0 ready, bit1 dirty.
/// - `0x20 KEY_DATA` (R): pops the next key code, 0 when empty.
/// - `0x24 KEY_STATUS` (R/W): read bit0 = queue non-empty; any write clears
///   the queue and the last key.
/// - `0x28 KEY_LAST` (R): most recently pushed key.
///
/// The framebuffer is byte-addressable with 1/2/4/8-byte little-endian
/// accesses; any write marks the frame dirty.
pub struct DisplayDevice {
    width: u32,
    height: u32,
    frame: Mutex<Vec<u8>>,
    dirty: AtomicBool,
    present_requested: AtomicBool,
    input: Mutex<InputState>,
    surface: Mutex<Option<Box<dyn PresentationSurface>>>,
    sync: SyncState,
}

impl DisplayDevice {
    /// Headless display: everything works, presents skip the surface copy.
    pub fn new(width: u32, height: u32) -> Self {
        let frame_bytes = width as usize * height as usize * BYTES_PER_PIXEL as usize;
        Self {
            width,
            height,
            frame: Mutex::new(vec![0u8; frame_bytes]),
            // Mark the initial blank frame dirty so the first present paints it.
            dirty: AtomicBool::new(true),
            present_requested: AtomicBool::new(false),
            input: Mutex::new(InputState {
                key_queue: VecDeque::new(),
                last_key: 0,
                quit_requested: false,
            }),
            surface: Mutex::new(None),
            sync: SyncState::new(),
        }
    }

    pub fn with_surface(width: u32, height: u32, surface: Box<dyn PresentationSurface>) -> Self {
        let display = Self::new(width, height);
        *display.surface.lock().unwrap() = Some(surface);
        display
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.width * BYTES_PER_PIXEL
    }

    pub fn framebuffer_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(BYTES_PER_PIXEL)
    }

    /// Total mapped window: control region plus framebuffer.
    pub fn mapped_size(&self) -> u64 {
        FRAMEBUFFER_OFFSET + self.framebuffer_size()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_present_requested(&self) -> bool {
        self.present_requested.load(Ordering::Acquire)
    }

    /// Atomically clear and return the present request flag.
    pub fn consume_present_request(&self) -> bool {
        self.present_requested.swap(false, Ordering::AcqRel)
    }

    pub fn quit_requested(&self) -> bool {
        self.input.lock().unwrap().quit_requested
    }

    /// Host-side input injection (tests, debug shell).
    pub fn push_key(&self, key: u32) {
        let mut input = self.input.lock().unwrap();
        input.last_key = key;
        input.key_queue.push_back(key);
    }

    /// Drain surface events into the key queue / quit flag.
    ///
    /// Waits up to `timeout_ms` for the first event, then drains without
    /// blocking. Safe with `timeout_ms == 0`. Headless displays sleep for
    /// the timeout so poll loops do not spin.
    pub fn pump_events(&self, timeout_ms: u32) {
        let mut surface = self.surface.lock().unwrap();
        let Some(surface) = surface.as_mut() else {
            drop(surface);
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(u64::from(timeout_ms)));
            }
            return;
        };
        if timeout_ms > 0 {
            if let Some(event) = surface.poll_event(timeout_ms) {
                self.handle_event(event);
            }
        }
        while let Some(event) = surface.poll_event(0) {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: SurfaceEvent) {
        let mut input = self.input.lock().unwrap();
        match event {
            SurfaceEvent::KeyDown(key) => {
                input.last_key = key;
                input.key_queue.push_back(key);
            }
            SurfaceEvent::Quit => input.quit_requested = true,
        }
    }

    /// Copy the framebuffer to the surface and clear the dirty flag.
    /// Headless displays only clear the flag.
    pub fn present(&self) {
        let frame = self.frame.lock().unwrap();
        if let Some(surface) = self.surface.lock().unwrap().as_mut() {
            surface.present(&frame, self.width, self.height, self.pitch());
        }
        self.dirty.store(false, Ordering::Release);
    }

    fn read_register(&self, access: &MemAccess) -> MemResponse {
        if access.size != REG_SIZE {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        match access.address {
            REG_WIDTH => MemResponse::success(u64::from(self.width)),
            REG_HEIGHT => MemResponse::success(u64::from(self.height)),
            REG_PITCH => MemResponse::success(u64::from(self.pitch())),
            REG_STATUS => {
                let mut status = STATUS_READY;
                if self.is_dirty() {
                    status |= STATUS_DIRTY;
                }
                MemResponse::success(status)
            }
            REG_KEY_DATA => {
                let mut input = self.input.lock().unwrap();
                let key = input.key_queue.pop_front().map_or(0, u64::from);
                MemResponse::success(key)
            }
            REG_KEY_STATUS => {
                let input = self.input.lock().unwrap();
                let status = if input.key_queue.is_empty() { 0 } else { KEY_STATUS_READY };
                MemResponse::success(status)
            }
            REG_KEY_LAST => {
                let input = self.input.lock().unwrap();
                MemResponse::success(u64::from(input.last_key))
            }
            _ => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    fn write_register(&self, access: &MemAccess) -> MemResponse {
        if access.size != REG_SIZE {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        match access.address {
            REG_CTRL => {
                if access.data & CTRL_PRESENT != 0 {
                    self.present_requested.store(true, Ordering::Release);
                }
                MemResponse::success(0)
            }
            REG_KEY_STATUS => {
                let mut input = self.input.lock().unwrap();
                input.key_queue.clear();
                input.last_key = 0;
                MemResponse::success(0)
            }
            _ => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    fn in_range(&self, access: &MemAccess) -> bool {
        if !matches!(access.size, 1 | 2 | 4 | 8) {
            return false;
        }
        let mapped = self.mapped_size();
        access.address < mapped && u64::from(access.size) <= mapped - access.address
    }
}

impl Device for DisplayDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Display
    }

    fn read(&self, access: &MemAccess) -> MemResponse {
        if !self.in_range(access) {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        if access.address < FRAMEBUFFER_OFFSET {
            return self.read_register(access);
        }
        let offset = (access.address - FRAMEBUFFER_OFFSET) as usize;
        let frame = self.frame.lock().unwrap();
        let value = LittleEndian::read_uint(&frame[offset..], access.size as usize);
        MemResponse::success(value)
    }

    fn write(&self, access: &MemAccess) -> MemResponse {
        if !self.in_range(access) {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        if access.address < FRAMEBUFFER_OFFSET {
            return self.write_register(access);
        }
        let offset = (access.address - FRAMEBUFFER_OFFSET) as usize;
        let mut frame = self.frame.lock().unwrap();
        LittleEndian::write_uint(&mut frame[offset..], access.data, access.size as usize);
        drop(frame);
        self.dirty.store(true, Ordering::Release);
        MemResponse::success(0)
    }

    fn update_frequency(&self) -> u32 {
        60
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct FakeSurface {
        events: Vec<SurfaceEvent>,
        presents: Arc<AtomicU32>,
    }

    impl PresentationSurface for FakeSurface {
        fn poll_event(&mut self, _timeout_ms: u32) -> Option<SurfaceEvent> {
            if self.events.is_empty() {
                None
            } else {
                Some(self.events.remove(0))
            }
        }

        fn present(&mut self, frame: &[u8], width: u32, height: u32, pitch: u32) {
            assert_eq!(frame.len() as u32, height * pitch);
            assert_eq!(pitch, width * BYTES_PER_PIXEL);
            self.presents.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn geometry_registers_report_the_layout() {
        let display = DisplayDevice::new(16, 8);
        assert_eq!(display.read(&MemAccess::read(REG_WIDTH, 4)).data, 16);
        assert_eq!(display.read(&MemAccess::read(REG_HEIGHT, 4)).data, 8);
        assert_eq!(display.read(&MemAccess::read(REG_PITCH, 4)).data, 64);
        assert_eq!(display.mapped_size(), 0x1000 + 16 * 8 * 4);
    }

    #[test]
    fn framebuffer_writes_mark_dirty_and_present_clears() {
        let display = DisplayDevice::new(4, 4);
        display.present();
        assert!(!display.is_dirty());
        let status = display.read(&MemAccess::read(REG_STATUS, 4)).data;
        assert_eq!(status, STATUS_READY);

        assert!(display.write(&MemAccess::write(FRAMEBUFFER_OFFSET + 3, 1, 0xff)).ok);
        let status = display.read(&MemAccess::read(REG_STATUS, 4)).data;
        assert_eq!(status, STATUS_READY | STATUS_DIRTY);

        display.present();
        assert!(!display.is_dirty());
    }

    #[test]
    fn framebuffer_roundtrips_little_endian() {
        let display = DisplayDevice::new(4, 4);
        display.write(&MemAccess::write(FRAMEBUFFER_OFFSET, 4, 0xAA55_1234));
        assert_eq!(display.read(&MemAccess::read(FRAMEBUFFER_OFFSET, 4)).data, 0xAA55_1234);
        assert_eq!(display.read(&MemAccess::read(FRAMEBUFFER_OFFSET, 1)).data, 0x34);
        assert_eq!(display.read(&MemAccess::read(FRAMEBUFFER_OFFSET + 3, 1)).data, 0xAA);
    }

    #[test]
    fn present_request_consumes_exactly_once_per_ctrl_write() {
        let display = DisplayDevice::new(4, 4);
        assert!(!display.consume_present_request());

        display.write(&MemAccess::write(REG_CTRL, 4, CTRL_PRESENT));
        assert!(display.consume_present_request());
        assert!(!display.consume_present_request());

        // Bit0 clear is ignored.
        display.write(&MemAccess::write(REG_CTRL, 4, 0x2));
        assert!(!display.consume_present_request());
    }

    #[test]
    fn key_queue_is_fifo_with_last_key_snapshot() {
        let display = DisplayDevice::new(4, 4);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_STATUS, 4)).data, 0);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_DATA, 4)).data, 0);

        display.push_key(0x41);
        display.push_key(0x42);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_STATUS, 4)).data, KEY_STATUS_READY);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_LAST, 4)).data, 0x42);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_DATA, 4)).data, 0x41);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_DATA, 4)).data, 0x42);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_DATA, 4)).data, 0);

        // KEY_LAST survives the drain; a KEY_STATUS write clears both.
        assert_eq!(display.read(&MemAccess::read(REG_KEY_LAST, 4)).data, 0x42);
        display.push_key(0x43);
        display.write(&MemAccess::write(REG_KEY_STATUS, 4, 0));
        assert_eq!(display.read(&MemAccess::read(REG_KEY_STATUS, 4)).data, 0);
        assert_eq!(display.read(&MemAccess::read(REG_KEY_LAST, 4)).data, 0);
    }

    #[test]
    fn out_of_range_accesses_fault() {
        let display = DisplayDevice::new(2, 2);
        let mapped = display.mapped_size();
        assert!(!display.read(&MemAccess::read(mapped, 1)).ok);
        assert!(!display.read(&MemAccess::read(mapped - 2, 4)).ok);
        assert!(!display.write(&MemAccess::write(mapped, 1, 0)).ok);
        // Unknown control offsets and non-word register accesses fault.
        assert!(!display.read(&MemAccess::read(0x14, 4)).ok);
        assert!(!display.read(&MemAccess::read(REG_STATUS, 2)).ok);
        assert!(!display.write(&MemAccess::write(REG_WIDTH, 4, 1)).ok);
    }

    #[test]
    fn pump_routes_surface_events() {
        let presents = Arc::new(AtomicU32::new(0));
        let surface = FakeSurface {
            events: vec![SurfaceEvent::KeyDown(0x20), SurfaceEvent::Quit],
            presents: Arc::clone(&presents),
        };
        let display = DisplayDevice::with_surface(4, 4, Box::new(surface));
        assert!(!display.quit_requested());
        display.pump_events(0);
        assert!(display.quit_requested());
        assert_eq!(display.read(&MemAccess::read(REG_KEY_LAST, 4)).data, 0x20);

        display.present();
        assert_eq!(presents.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn headless_pump_is_safe_and_nonblocking_at_zero() {
        let display = DisplayDevice::new(4, 4);
        display.pump_events(0);
        display.pump_events(1);
        assert!(!display.quit_requested());
    }

    #[test]
    fn declares_sixty_hertz() {
        let display = DisplayDevice::new(4, 4);
        assert_eq!(display.update_frequency(), 60);
        assert!(!display.has_tick());
    }
}
