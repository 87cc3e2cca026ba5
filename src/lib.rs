//! soc-emu library
//!
//! Core logic for a modular SoC emulator: an address-routed memory bus,
//! memory-mapped peripherals, a pluggable CPU executor, and a debugger that
//! multiplexes CPU, display, and command threads.
//!
//! # Module Organization
//!
//! - [`bus`]: Address router and address-plan validation
//! - [`device`]: Device model and the reference peripherals (RAM/ROM, UART,
//!   timer, display)
//! - [`cpu`]: Executor contract and the reference toy-ISA core
//! - [`trace`]: Structured per-instruction execution trace
//! - [`debugger`]: Run-state machine, thread orchestration, debug shell
//! - [`config`]: CLI and config-file parsing
//! - [`logging`]: Log facade setup and output sinks
//! - [`emulator`]: Host wiring and session entry points

pub mod bus;
pub mod config;
pub mod cpu;
pub mod debugger;
pub mod device;
pub mod emulator;
pub mod logging;
pub mod trace;
