//! CPU executor contract.
//!
//! The host drives a CPU core through the [`CpuExecutor`] trait and hands it
//! a [`CpuHost`] capability at attach time. The executor performs all bus
//! traffic, breakpoint queries, and trace emission through that handle, so
//! neither side owns the other; the controller owns both.
//!
//! The shared bus transaction types ([`MemAccess`], [`MemResponse`]) live
//! here because every layer above the devices speaks them.

use std::fmt;
use std::sync::Arc;

use crate::trace::{TraceOptions, TraceRecord};

pub mod toy;

pub use toy::ToyCpu;

/// Transaction direction on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Fetch,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => write!(f, "R"),
            AccessKind::Write => write!(f, "W"),
            AccessKind::Fetch => write!(f, "F"),
        }
    }
}

/// A single bus transaction.
///
/// `size` is in bytes and must be 1, 2, 4, or 8; devices reject anything
/// else. `data` carries the write payload and is ignored for reads.
#[derive(Debug, Clone, Copy)]
pub struct MemAccess {
    pub address: u64,
    pub size: u32,
    pub kind: AccessKind,
    pub data: u64,
}

impl MemAccess {
    pub fn read(address: u64, size: u32) -> Self {
        Self { address, size, kind: AccessKind::Read, data: 0 }
    }

    pub fn write(address: u64, size: u32, data: u64) -> Self {
        Self { address, size, kind: AccessKind::Write, data }
    }

    pub fn fetch(address: u64, size: u32) -> Self {
        Self { address, size, kind: AccessKind::Fetch, data: 0 }
    }
}

/// Fault classification carried in [`MemResponse`] and executor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultKind {
    /// No fault recorded.
    #[default]
    None,
    /// Decoder rejected the instruction encoding.
    InvalidOp,
    /// Access outside any mapped region or rejected by a device range check.
    AccessFault,
    /// Device had no handler for the requested operation.
    DeviceFault,
    /// The core executed a halt instruction.
    Halt,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::None => write!(f, "none"),
            FaultKind::InvalidOp => write!(f, "invalid-op"),
            FaultKind::AccessFault => write!(f, "access-fault"),
            FaultKind::DeviceFault => write!(f, "device-fault"),
            FaultKind::Halt => write!(f, "halt"),
        }
    }
}

/// Detail of the most recent fault: what kind, and the access that caused it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInfo {
    pub kind: FaultKind,
    pub address: u64,
    pub size: u32,
    pub data: u64,
}

impl FaultInfo {
    pub fn new(kind: FaultKind, address: u64, size: u32) -> Self {
        Self { kind, address, size, data: 0 }
    }

    pub fn is_none(&self) -> bool {
        self.kind == FaultKind::None
    }
}

/// Response to a bus transaction.
///
/// On success, `data` is the zero-extended little-endian value of the read
/// bytes (zero for writes). On failure, `error` identifies the fault and the
/// offending access.
#[derive(Debug, Clone, Copy)]
pub struct MemResponse {
    pub ok: bool,
    pub data: u64,
    pub latency_cycles: u32,
    pub error: FaultInfo,
}

impl MemResponse {
    /// Successful transaction carrying `data`.
    pub fn success(data: u64) -> Self {
        Self { ok: true, data, latency_cycles: 0, error: FaultInfo::default() }
    }

    /// Failed transaction; records the faulting access.
    pub fn fault(kind: FaultKind, access: &MemAccess) -> Self {
        Self {
            ok: false,
            data: 0,
            latency_cycles: 0,
            error: FaultInfo::new(kind, access.address, access.size),
        }
    }
}

/// Controller-visible run state of the CPU thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Running,
    Pause,
    Halted,
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuState::Running => write!(f, "RUNNING"),
            CpuState::Pause => write!(f, "PAUSED"),
            CpuState::Halted => write!(f, "HALTED"),
        }
    }
}

/// Outcome of a [`CpuExecutor::step`] batch.
///
/// `ok` is false when the batch stopped on a fault (recorded in the
/// executor's last error) or on a breakpoint hit before executing the
/// breakpointed instruction (last error stays `None`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StepResult {
    pub ok: bool,
    pub instructions: u64,
    pub cycles: u64,
}

impl StepResult {
    pub fn empty() -> Self {
        Self { ok: true, instructions: 0, cycles: 0 }
    }
}

/// Capability the executor receives at attach time.
///
/// All bus traffic, breakpoint checks, and trace emission from the executor
/// go through this handle. Implementations must be cheap on the hot paths:
/// `has_breakpoints` and `trace_options` are queried every instruction.
pub trait CpuHost: Send + Sync {
    fn bus_read(&self, access: &MemAccess) -> MemResponse;
    fn bus_write(&self, access: &MemAccess) -> MemResponse;
    fn is_breakpoint(&self, address: u64) -> bool;
    fn has_breakpoints(&self) -> bool;
    fn trace_options(&self) -> TraceOptions;
    fn log_trace(&self, record: &TraceRecord);
}

/// Polymorphic CPU core driven by the host.
///
/// The executor runs exclusively on one thread at a time; bus accesses reach
/// the bus sequentially through the attached [`CpuHost`], so implementations
/// need no internal locking.
pub trait CpuExecutor: Send {
    /// Zero registers, cycle counter, pc, and the recorded error.
    fn reset(&mut self);

    /// Execute until either limit is reached, a fault occurs, or a
    /// breakpoint is hit. `step(0, 0)` is a no-op returning an ok result.
    fn step(&mut self, max_instructions: u64, max_cycles: u64) -> StepResult;

    fn last_error(&self) -> FaultInfo;

    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn cycle(&self) -> u64;

    /// Register read. Index 0 is hard-wired to zero; out-of-range indices
    /// read as zero.
    fn register(&self, index: u32) -> u64;
    /// Register write. Writes to index 0 or out-of-range indices are
    /// silently dropped.
    fn set_register(&mut self, index: u32, value: u64);
    fn register_count(&self) -> u32;

    /// Store the host capability the executor performs bus traffic through.
    fn attach_host(&mut self, host: Arc<dyn CpuHost>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_success_carries_data() {
        let resp = MemResponse::success(0xdead_beef);
        assert!(resp.ok);
        assert_eq!(resp.data, 0xdead_beef);
        assert!(resp.error.is_none());
    }

    #[test]
    fn response_fault_records_access() {
        let access = MemAccess::read(0x1000, 4);
        let resp = MemResponse::fault(FaultKind::AccessFault, &access);
        assert!(!resp.ok);
        assert_eq!(resp.error.kind, FaultKind::AccessFault);
        assert_eq!(resp.error.address, 0x1000);
        assert_eq!(resp.error.size, 4);
    }

    #[test]
    fn fault_kind_default_is_none() {
        assert_eq!(FaultInfo::default().kind, FaultKind::None);
        assert!(FaultInfo::default().is_none());
    }

    #[test]
    fn state_display_matches_status_strings() {
        assert_eq!(CpuState::Running.to_string(), "RUNNING");
        assert_eq!(CpuState::Pause.to_string(), "PAUSED");
        assert_eq!(CpuState::Halted.to_string(), "HALTED");
    }
}
