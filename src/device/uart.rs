//! UART device: RX byte queue, TX buffer with size/idle flush.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::cpu::{FaultKind, MemAccess, MemResponse};
use crate::device::{Device, DeviceKind, SyncState};
use crate::logging::DeviceSink;

const REG_DATA: u64 = 0x0;
const REG_STATUS: u64 = 0x4;
const REG_SIZE: u32 = 4;

const STATUS_RX_READY: u64 = 1 << 0;
const STATUS_TX_READY: u64 = 1 << 1;

/// TX bytes accumulated before a forced flush.
const TX_FLUSH_BYTES: usize = 256;
/// Idle cycles with a non-empty TX buffer before a flush.
const TX_IDLE_FLUSH_CYCLES: u64 = 10_000;

struct UartState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    idle_cycles: u64,
    sink: Option<DeviceSink>,
}

impl UartState {
    fn flush_tx(&mut self) {
        if self.tx.is_empty() {
            return;
        }
        match &self.sink {
            Some(sink) => sink(&self.tx),
            None => {
                use std::io::Write;
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                let _ = handle.write_all(&self.tx);
                let _ = handle.flush();
            }
        }
        self.tx.clear();
    }
}

/// Memory-mapped UART.
///
/// Register map (4-byte accesses only):
/// - `0x0 DATA` (R/W): read pops the next RX byte (0 when empty; the status
///   bit distinguishes), write enqueues the low byte into the TX buffer.
/// - `0x4 STATUS` (R): bit0 = RX non-empty, bit1 = TX ready (always set).
///
/// TX flushes to the device-output sink as one contiguous blob when the
/// buffer reaches 256 bytes, when 10,000 idle cycles pass with a non-empty
/// buffer, or on drop.
pub struct UartDevice {
    state: Mutex<UartState>,
    sync: SyncState,
}

impl UartDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(UartState {
                rx: VecDeque::new(),
                tx: Vec::new(),
                idle_cycles: 0,
                sink: None,
            }),
            sync: SyncState::new(),
        }
    }

    /// External input path: enqueue a byte for the guest to read.
    pub fn push_rx(&self, byte: u8) {
        self.state.lock().unwrap().rx.push_back(byte);
    }

    /// Install the TX output sink (stdout when none is set).
    pub fn set_sink(&self, sink: DeviceSink) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    /// Force out any buffered TX bytes.
    pub fn flush(&self) {
        self.state.lock().unwrap().flush_tx();
    }

    fn status(state: &UartState) -> u64 {
        let mut status = STATUS_TX_READY;
        if !state.rx.is_empty() {
            status |= STATUS_RX_READY;
        }
        status
    }
}

impl Default for UartDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UartDevice {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.flush_tx();
        }
    }
}

impl Device for UartDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Uart
    }

    fn read(&self, access: &MemAccess) -> MemResponse {
        if access.size != REG_SIZE {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        let mut state = self.state.lock().unwrap();
        match access.address {
            REG_DATA => {
                let byte = state.rx.pop_front().map_or(0, u64::from);
                MemResponse::success(byte)
            }
            REG_STATUS => MemResponse::success(Self::status(&state)),
            _ => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    fn write(&self, access: &MemAccess) -> MemResponse {
        if access.size != REG_SIZE {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        match access.address {
            REG_DATA => {
                let mut state = self.state.lock().unwrap();
                state.tx.push((access.data & 0xff) as u8);
                state.idle_cycles = 0;
                if state.tx.len() >= TX_FLUSH_BYTES {
                    state.flush_tx();
                }
                MemResponse::success(0)
            }
            _ => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    fn tick(&self, delta_cycles: u64) {
        let mut state = self.state.lock().unwrap();
        state.idle_cycles = state.idle_cycles.saturating_add(delta_cycles);
        if !state.tx.is_empty() && state.idle_cycles >= TX_IDLE_FLUSH_CYCLES {
            state.flush_tx();
        }
    }

    fn has_tick(&self) -> bool {
        true
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (DeviceSink, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let blobs: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_blobs = Arc::clone(&blobs);
        let sink: DeviceSink = Arc::new(move |bytes: &[u8]| {
            sink_blobs.lock().unwrap().push(bytes.to_vec());
        });
        (sink, blobs)
    }

    #[test]
    fn status_tracks_rx_queue() {
        let uart = UartDevice::new();
        let status = uart.read(&MemAccess::read(REG_STATUS, 4)).data;
        assert_eq!(status, STATUS_TX_READY);

        uart.push_rx(b'x');
        let status = uart.read(&MemAccess::read(REG_STATUS, 4)).data;
        assert_eq!(status, STATUS_TX_READY | STATUS_RX_READY);
    }

    #[test]
    fn rx_pops_in_fifo_order_and_drains_to_zero() {
        let uart = UartDevice::new();
        uart.push_rx(b'a');
        uart.push_rx(b'b');
        assert_eq!(uart.read(&MemAccess::read(REG_DATA, 4)).data, u64::from(b'a'));
        assert_eq!(uart.read(&MemAccess::read(REG_DATA, 4)).data, u64::from(b'b'));
        assert_eq!(uart.read(&MemAccess::read(REG_DATA, 4)).data, 0);
        assert_eq!(uart.read(&MemAccess::read(REG_STATUS, 4)).data, STATUS_TX_READY);
    }

    #[test]
    fn tx_flushes_once_at_threshold() {
        let uart = UartDevice::new();
        let (sink, blobs) = collector();
        uart.set_sink(sink);
        for i in 0..TX_FLUSH_BYTES {
            uart.write(&MemAccess::write(REG_DATA, 4, i as u64));
        }
        let blobs = blobs.lock().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].len(), TX_FLUSH_BYTES);
        assert_eq!(blobs[0][0], 0);
        assert_eq!(blobs[0][255], 255);
    }

    #[test]
    fn idle_ticks_flush_pending_tx() {
        let uart = UartDevice::new();
        let (sink, blobs) = collector();
        uart.set_sink(sink);
        uart.write(&MemAccess::write(REG_DATA, 4, u64::from(b'h')));
        uart.write(&MemAccess::write(REG_DATA, 4, u64::from(b'i')));

        uart.tick(TX_IDLE_FLUSH_CYCLES - 1);
        assert!(blobs.lock().unwrap().is_empty());

        // A write resets the idle counter.
        uart.write(&MemAccess::write(REG_DATA, 4, u64::from(b'!')));
        uart.tick(TX_IDLE_FLUSH_CYCLES - 1);
        assert!(blobs.lock().unwrap().is_empty());

        uart.tick(1);
        let blobs = blobs.lock().unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0], b"hi!");
    }

    #[test]
    fn drop_flushes_remaining_tx() {
        let (sink, blobs) = collector();
        {
            let uart = UartDevice::new();
            uart.set_sink(sink);
            uart.write(&MemAccess::write(REG_DATA, 4, u64::from(b'z')));
        }
        assert_eq!(blobs.lock().unwrap().as_slice(), &[b"z".to_vec()]);
    }

    #[test]
    fn only_word_accesses_are_accepted() {
        let uart = UartDevice::new();
        for &size in &[1u32, 2, 8] {
            assert_eq!(
                uart.read(&MemAccess::read(REG_DATA, size)).error.kind,
                FaultKind::AccessFault
            );
            assert_eq!(
                uart.write(&MemAccess::write(REG_DATA, size, 0)).error.kind,
                FaultKind::AccessFault
            );
        }
        // Unknown offsets fault; STATUS is read-only.
        assert!(!uart.read(&MemAccess::read(0x8, 4)).ok);
        assert!(!uart.write(&MemAccess::write(REG_STATUS, 4, 0)).ok);
    }
}
