//! Debugger and thread controller.
//!
//! The debugger owns the run-state machine and the three long-lived threads
//! of a session: the CPU thread executes instruction batches against the
//! bus, the display thread pumps surface events and drives presents, and the
//! controlling thread consumes user commands (interactive) or pumps stdin
//! into the UART (non-interactive).
//!
//! It also carries the executor-facing [`HostBridge`]: the capability handle
//! the CPU core uses for bus traffic, breakpoint checks, and trace emission.
//! The debugger owns both the bridge and the executor; neither owns the
//! other.

use std::io::{BufRead, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::bus::MemoryBus;
use crate::cpu::{CpuExecutor, CpuHost, CpuState, FaultInfo, FaultKind, MemAccess, MemResponse};
use crate::device::{DisplayDevice, UartDevice};
use crate::logging;
use crate::trace::{self, TraceFormatter, TraceOptions, TraceRecord};

pub mod expr;

use expr::EvalContext;

/// Consumer of rendered trace lines.
pub type TraceLineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Instructions per free-run batch.
const FREE_RUN_BATCH: u64 = 1000;
/// Fallback sync threshold when no CPU frequency is configured.
const DEFAULT_BATCH_CYCLES: u64 = 1000;
/// Display present throttle.
const PRESENT_INTERVAL: Duration = Duration::from_millis(16);
/// Event-poll timeout when the display has nothing to do.
const IDLE_POLL_MS: u32 = 8;
/// Minimum interval between CPS recomputations.
const CPS_WINDOW: Duration = Duration::from_millis(30);

const STATE_RUNNING: u8 = 0;
const STATE_PAUSE: u8 = 1;
const STATE_HALTED: u8 = 2;

/// Shared run-state machine: CPU state, exit flag, pending single steps,
/// and the condition variable the CPU thread parks on.
pub struct RunState {
    state: AtomicU8,
    should_exit: AtomicBool,
    steps_pending: AtomicU32,
    gate: Mutex<()>,
    cv: Condvar,
}

impl RunState {
    fn new(initial: CpuState) -> Self {
        Self {
            state: AtomicU8::new(Self::encode(initial)),
            should_exit: AtomicBool::new(false),
            steps_pending: AtomicU32::new(0),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn encode(state: CpuState) -> u8 {
        match state {
            CpuState::Running => STATE_RUNNING,
            CpuState::Pause => STATE_PAUSE,
            CpuState::Halted => STATE_HALTED,
        }
    }

    pub fn state(&self) -> CpuState {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => CpuState::Running,
            STATE_PAUSE => CpuState::Pause,
            _ => CpuState::Halted,
        }
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(Self::encode(state), Ordering::Release);
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    pub fn request_exit(&self) {
        self.should_exit.store(true, Ordering::Release);
        self.notify();
    }

    pub fn steps_pending(&self) -> u32 {
        self.steps_pending.load(Ordering::Acquire)
    }

    fn add_steps(&self, count: u32) {
        self.steps_pending.fetch_add(count, Ordering::AcqRel);
    }

    fn take_steps(&self) -> u32 {
        self.steps_pending.swap(0, Ordering::AcqRel)
    }

    pub fn notify(&self) {
        let _guard = self.gate.lock().unwrap();
        self.cv.notify_all();
    }

    /// Park until there is work: exit requested, free-running, or pending
    /// steps. Tolerates spurious wakes by re-checking the predicate.
    fn wait_for_work(&self) {
        let guard = self.gate.lock().unwrap();
        let _guard = self
            .cv
            .wait_while(guard, |_| {
                !self.should_exit()
                    && self.state() != CpuState::Running
                    && self.steps_pending() == 0
            })
            .unwrap();
    }
}

const OPT_INSTRUCTION: u8 = 1 << 0;
const OPT_MEM: u8 = 1 << 1;
const OPT_BRANCH: u8 = 1 << 2;

struct TraceControl {
    options: AtomicU8,
    formatter: Mutex<Option<TraceFormatter>>,
    sink: Mutex<Option<TraceLineSink>>,
}

impl TraceControl {
    fn new() -> Self {
        Self {
            options: AtomicU8::new(0),
            formatter: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    fn options(&self) -> TraceOptions {
        let bits = self.options.load(Ordering::Relaxed);
        TraceOptions {
            log_instruction: bits & OPT_INSTRUCTION != 0,
            log_mem_events: bits & OPT_MEM != 0,
            log_branch_prediction: bits & OPT_BRANCH != 0,
        }
    }

    fn set_options(&self, options: TraceOptions) {
        let mut bits = 0;
        if options.log_instruction {
            bits |= OPT_INSTRUCTION;
        }
        if options.log_mem_events {
            bits |= OPT_MEM;
        }
        if options.log_branch_prediction {
            bits |= OPT_BRANCH;
        }
        self.options.store(bits, Ordering::Relaxed);
    }
}

/// Executor-facing capability: bus access, breakpoint checks, trace sink.
///
/// `has_breakpoints` is an atomic fast path so the per-instruction check
/// stays cheap; the address list is only locked when it is non-empty.
pub struct HostBridge {
    bus: Arc<MemoryBus>,
    breakpoints: Mutex<Vec<u64>>,
    breakpoints_active: AtomicBool,
    trace: TraceControl,
}

impl HostBridge {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self {
            bus,
            breakpoints: Mutex::new(Vec::new()),
            breakpoints_active: AtomicBool::new(false),
            trace: TraceControl::new(),
        }
    }

    pub fn add_breakpoint(&self, address: u64) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        if !breakpoints.contains(&address) {
            breakpoints.push(address);
        }
        self.breakpoints_active.store(true, Ordering::Release);
    }

    pub fn remove_breakpoint(&self, address: u64) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        breakpoints.retain(|&a| a != address);
        self.breakpoints_active.store(!breakpoints.is_empty(), Ordering::Release);
    }

    pub fn breakpoints(&self) -> Vec<u64> {
        self.breakpoints.lock().unwrap().clone()
    }

    pub fn configure_trace(&self, options: TraceOptions) {
        self.trace.set_options(options);
    }

    pub fn set_trace_formatter(&self, formatter: TraceFormatter) {
        *self.trace.formatter.lock().unwrap() = Some(formatter);
    }

    /// Redirect rendered trace lines away from the log facade.
    pub fn set_trace_sink(&self, sink: TraceLineSink) {
        *self.trace.sink.lock().unwrap() = Some(sink);
    }
}

impl CpuHost for HostBridge {
    fn bus_read(&self, access: &MemAccess) -> MemResponse {
        self.bus.read(access)
    }

    fn bus_write(&self, access: &MemAccess) -> MemResponse {
        self.bus.write(access)
    }

    fn is_breakpoint(&self, address: u64) -> bool {
        if !self.has_breakpoints() {
            return false;
        }
        self.breakpoints.lock().unwrap().contains(&address)
    }

    fn has_breakpoints(&self) -> bool {
        self.breakpoints_active.load(Ordering::Acquire)
    }

    fn trace_options(&self) -> TraceOptions {
        self.trace.options()
    }

    fn log_trace(&self, record: &TraceRecord) {
        let options = self.trace.options();
        if !trace::should_emit(record, &options) {
            return;
        }
        let line = {
            let formatter = self.trace.formatter.lock().unwrap();
            match formatter.as_ref() {
                Some(custom) => custom(record, &options),
                None => trace::default_format(record, &options),
            }
        };
        let sink = self.trace.sink.lock().unwrap();
        match sink.as_ref() {
            Some(sink) => sink(&line),
            None => log::info!(target: "trace", "{line}"),
        }
    }
}

struct CpsWindow {
    at: Instant,
    cycles: u64,
}

/// The session controller.
pub struct Debugger {
    host: Arc<HostBridge>,
    bus: Arc<MemoryBus>,
    cpu: Mutex<Box<dyn CpuExecutor>>,
    run: RunState,
    display: Option<Arc<DisplayDevice>>,
    uart: Option<Arc<UartDevice>>,
    cpu_frequency: AtomicU32,
    batch_cycles: AtomicU64,
    total_instructions: AtomicU64,
    cps_bits: AtomicU64,
    cps_window: Mutex<CpsWindow>,
    last_cmd_ok: AtomicBool,
}

impl Debugger {
    pub fn new(mut cpu: Box<dyn CpuExecutor>, bus: Arc<MemoryBus>) -> Self {
        let host = Arc::new(HostBridge::new(Arc::clone(&bus)));
        cpu.attach_host(Arc::clone(&host) as Arc<dyn CpuHost>);
        Self {
            host,
            bus,
            cpu: Mutex::new(cpu),
            run: RunState::new(CpuState::Pause),
            display: None,
            uart: None,
            cpu_frequency: AtomicU32::new(0),
            batch_cycles: AtomicU64::new(DEFAULT_BATCH_CYCLES),
            total_instructions: AtomicU64::new(0),
            cps_bits: AtomicU64::new(0),
            cps_window: Mutex::new(CpsWindow { at: Instant::now(), cycles: 0 }),
            last_cmd_ok: AtomicBool::new(true),
        }
    }

    pub fn host(&self) -> &Arc<HostBridge> {
        &self.host
    }

    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    pub fn set_display(&mut self, display: Arc<DisplayDevice>) {
        self.display = Some(display);
    }

    pub fn set_uart(&mut self, uart: Arc<UartDevice>) {
        self.uart = Some(uart);
    }

    pub fn set_cpu_frequency(&self, hz: u32) {
        self.cpu_frequency.store(hz, Ordering::Relaxed);
    }

    pub fn configure_trace(&self, options: TraceOptions) {
        self.host.configure_trace(options);
    }

    pub fn set_trace_formatter(&self, formatter: TraceFormatter) {
        self.host.set_trace_formatter(formatter);
    }

    pub fn set_trace_sink(&self, sink: TraceLineSink) {
        self.host.set_trace_sink(sink);
    }

    pub fn last_error(&self) -> FaultInfo {
        self.cpu.lock().unwrap().last_error()
    }

    pub fn cpu_cycle(&self) -> u64 {
        self.cpu.lock().unwrap().cycle()
    }

    pub fn cpu_pc(&self) -> u64 {
        self.cpu.lock().unwrap().pc()
    }

    pub fn read_registers(&self) -> Vec<u64> {
        let cpu = self.cpu.lock().unwrap();
        (0..cpu.register_count()).map(|i| cpu.register(i)).collect()
    }

    /// Byte-wise bus reads; unmapped bytes read as zero.
    pub fn scan_memory(&self, address: u64, length: u32) -> Vec<u8> {
        (0..u64::from(length))
            .map(|i| {
                let resp = self.bus.read(&MemAccess::read(address + i, 1));
                if resp.ok {
                    (resp.data & 0xff) as u8
                } else {
                    0
                }
            })
            .collect()
    }

    pub fn eval_expression(&self, expression: &str) -> u64 {
        expr::evaluate(&DebuggerContext { debugger: self }, expression)
    }

    /// Per-device sync thresholds and the CPU batch size in cycles.
    ///
    /// Devices declaring an update frequency get `max(1, f_cpu / f_dev)`;
    /// the minimum of those drives the batch. Without any declaration the
    /// display default of 60 Hz applies; without a CPU frequency the batch
    /// falls back to 1,000 cycles.
    pub fn derive_sync_threshold(&self) -> u64 {
        let f_cpu = u64::from(self.cpu_frequency.load(Ordering::Relaxed));
        if f_cpu == 0 {
            return DEFAULT_BATCH_CYCLES;
        }
        let mut minimum: Option<u64> = None;
        for device in self.bus.devices() {
            let f_dev = u64::from(device.update_frequency());
            if f_dev == 0 {
                continue;
            }
            let threshold = (f_cpu / f_dev).max(1);
            device.sync_state().set_threshold(threshold);
            minimum = Some(minimum.map_or(threshold, |m| m.min(threshold)));
        }
        minimum.unwrap_or_else(|| (f_cpu / 60).max(1))
    }

    /// Run the session until quit or halt. Interactive mode starts paused in
    /// the command shell; non-interactive starts running and pumps stdin
    /// into the UART.
    pub fn run(&self, interactive: bool) {
        let batch = self.derive_sync_threshold();
        self.batch_cycles.store(batch, Ordering::Relaxed);
        self.run.set_state(if interactive { CpuState::Pause } else { CpuState::Running });
        log::info!(
            "debugger: starting ({} mode, sync batch {} cycles)",
            if interactive { "interactive" } else { "run" },
            batch
        );

        if !interactive {
            if let Some(uart) = &self.uart {
                spawn_stdin_pump(Arc::clone(uart));
            }
        }

        std::thread::scope(|scope| {
            scope.spawn(|| self.cpu_thread());
            if let Some(display) = &self.display {
                scope.spawn(|| self.display_thread(display));
            }
            if interactive {
                self.command_loop();
            } else {
                self.wait_loop();
            }
            self.run.request_exit();
        });

        if let Some(uart) = &self.uart {
            uart.flush();
        }
        log::info!("debugger: stopped at cycle {}", self.cpu_cycle());
    }

    fn cpu_thread(&self) {
        loop {
            self.run.wait_for_work();
            if self.run.should_exit() {
                break;
            }
            self.cpu_batch();
        }
    }

    /// Service one CPU wakeup: consume pending steps or run a free-run
    /// batch, synchronize devices, and update the run state.
    fn cpu_batch(&self) {
        let pending = self.run.take_steps();
        let stepping = pending > 0;
        if stepping {
            self.run.set_state(CpuState::Running);
        } else if self.run.state() != CpuState::Running {
            return;
        }

        let (max_instructions, max_cycles) = if stepping {
            (u64::from(pending), u64::MAX)
        } else {
            (FREE_RUN_BATCH, self.batch_cycles.load(Ordering::Relaxed))
        };

        let (result, cycle, pc, error) = {
            let mut cpu = self.cpu.lock().unwrap();
            let result = cpu.step(max_instructions, max_cycles);
            (result, cpu.cycle(), cpu.pc(), cpu.last_error())
        };
        self.total_instructions.fetch_add(result.instructions, Ordering::Relaxed);
        self.bus.sync_all(cycle);
        self.update_cps(cycle);

        if !result.ok {
            if error.is_none() {
                log::info!("breakpoint hit at 0x{:x}", pc);
                self.run.set_state(CpuState::Pause);
            } else {
                match error.kind {
                    FaultKind::Halt => log::info!("cpu halted at 0x{:x}", error.address),
                    kind => log::error!(
                        "cpu fault: {} at 0x{:x} (size {})",
                        kind,
                        error.address,
                        error.size
                    ),
                }
                self.run.set_state(CpuState::Halted);
                self.run.notify();
            }
        } else if stepping {
            self.run.set_state(CpuState::Pause);
        }
    }

    fn update_cps(&self, cycle: u64) {
        let mut window = self.cps_window.lock().unwrap();
        let elapsed = window.at.elapsed();
        if elapsed < CPS_WINDOW {
            return;
        }
        let delta = cycle.saturating_sub(window.cycles);
        let cps = delta as f64 / elapsed.as_secs_f64();
        self.cps_bits.store(cps.to_bits(), Ordering::Relaxed);
        window.at = Instant::now();
        window.cycles = cycle;
    }

    fn display_thread(&self, display: &Arc<DisplayDevice>) {
        let mut last_present = Instant::now();
        while !self.run.should_exit() {
            let idle = !display.is_dirty() && !display.is_present_requested();
            display.pump_events(if idle { IDLE_POLL_MS } else { 0 });
            if display.quit_requested() {
                log::info!("display: quit requested");
                self.run.request_exit();
                break;
            }
            let now = Instant::now();
            if display.consume_present_request() {
                display.present();
                last_present = now;
            } else if display.is_dirty() && now.duration_since(last_present) >= PRESENT_INTERVAL {
                display.present();
                last_present = now;
            }
        }
    }

    /// Non-interactive foreground loop: wait for halt or exit.
    fn wait_loop(&self) {
        while !self.run.should_exit() && self.run.state() != CpuState::Halted {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn command_loop(&self) {
        let stdin = std::io::stdin();
        let mut line = String::new();
        while !self.run.should_exit() {
            print!("dbg> ");
            let _ = std::io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => {
                    self.run.request_exit();
                    break;
                }
                Ok(_) => {
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }
                    let ok = self.process_command(command);
                    self.last_cmd_ok.store(ok, Ordering::Relaxed);
                    println!("{}", self.compose_status());
                }
            }
        }
    }

    /// Execute one shell command. Returns whether it succeeded.
    pub fn process_command(&self, line: &str) -> bool {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return false;
        };
        match verb {
            "run" => {
                if self.run.state() == CpuState::Halted {
                    return false;
                }
                self.run.set_state(CpuState::Running);
                self.run.notify();
                true
            }
            "step" => {
                if self.run.state() == CpuState::Halted {
                    return false;
                }
                let count = parts
                    .next()
                    .and_then(|arg| arg.parse::<u32>().ok())
                    .unwrap_or(1)
                    .max(1);
                self.run.add_steps(count);
                self.run.set_state(CpuState::Running);
                self.run.notify();
                true
            }
            "pause" => {
                if self.run.state() == CpuState::Halted {
                    return false;
                }
                self.run.set_state(CpuState::Pause);
                true
            }
            "quit" | "exit" => {
                self.run.request_exit();
                true
            }
            "regs" => {
                for (index, value) in self.read_registers().iter().enumerate() {
                    println!("r{index} = 0x{value:x}");
                }
                true
            }
            "mem" => {
                let (Some(addr_arg), Some(len_arg)) = (parts.next(), parts.next()) else {
                    return false;
                };
                let address = self.eval_expression(addr_arg);
                let length = self.eval_expression(len_arg) as u32;
                let data = self.scan_memory(address, length);
                for (i, byte) in data.iter().enumerate() {
                    if i % 16 == 0 {
                        print!("{:08x}: ", address + i as u64);
                    }
                    print!("{byte:02x} ");
                    if i % 16 == 15 || i + 1 == data.len() {
                        println!();
                    }
                }
                true
            }
            "eval" => {
                let expression = line[verb.len()..].trim();
                if expression.is_empty() {
                    return false;
                }
                let value = self.eval_expression(expression);
                println!("0x{value:x} ({value})");
                true
            }
            "bp" => match parts.next() {
                Some("list") => {
                    for address in self.host.breakpoints() {
                        println!("0x{address:x}");
                    }
                    true
                }
                Some("add") => match parts.next() {
                    Some(arg) => {
                        self.host.add_breakpoint(self.eval_expression(arg));
                        true
                    }
                    None => false,
                },
                Some("del") => match parts.next() {
                    Some(arg) => {
                        self.host.remove_breakpoint(self.eval_expression(arg));
                        true
                    }
                    None => false,
                },
                _ => false,
            },
            "log" => match parts.next().and_then(logging::parse_level) {
                Some(level) => {
                    logging::set_level(level);
                    true
                }
                None => false,
            },
            "input" => {
                let payload = line[verb.len()..].strip_prefix(' ').unwrap_or("");
                if let Some(uart) = &self.uart {
                    for byte in payload.bytes() {
                        uart.push_rx(byte);
                    }
                }
                true
            }
            "help" => {
                println!("commands:");
                println!("  run                resume execution");
                println!("  step [N]           execute N instructions (default 1)");
                println!("  pause              pause execution");
                println!("  quit | exit        leave the session");
                println!("  regs               dump the register file");
                println!("  mem <addr> <len>   hex dump memory");
                println!("  eval <expr>        evaluate an expression");
                println!("  bp list|add|del    manage breakpoints");
                println!("  log <level>        set the log level");
                println!("  input <text>       push text into the UART");
                true
            }
            _ => {
                println!("Unknown command: {verb}");
                false
            }
        }
    }

    /// One-line session status: state, pc, counters, throughput, last
    /// command result.
    pub fn compose_status(&self) -> String {
        let (pc, cycle) = {
            let cpu = self.cpu.lock().unwrap();
            (cpu.pc(), cpu.cycle())
        };
        let instructions = self.total_instructions.load(Ordering::Relaxed);
        let ipc = if cycle == 0 { 0.0 } else { instructions as f64 / cycle as f64 };
        let cps = f64::from_bits(self.cps_bits.load(Ordering::Relaxed));
        format!(
            "[{}] pc=0x{:x} cycles={} instr={} ipc={:.2} cps={:.0} cmd={}",
            self.run.state(),
            pc,
            cycle,
            instructions,
            ipc,
            cps,
            if self.last_cmd_ok.load(Ordering::Relaxed) { "OK" } else { "ERR" }
        )
    }
}

struct DebuggerContext<'a> {
    debugger: &'a Debugger,
}

impl EvalContext for DebuggerContext<'_> {
    fn register(&self, name: &str) -> u64 {
        let cpu = self.debugger.cpu.lock().unwrap();
        if name.eq_ignore_ascii_case("pc") {
            return cpu.pc();
        }
        let digits = name.strip_prefix(['r', 'R']).unwrap_or(name);
        match digits.parse::<u32>() {
            Ok(index) => cpu.register(index),
            Err(_) => 0,
        }
    }

    fn read_word(&self, address: u64) -> u64 {
        let resp = self.debugger.bus.read(&MemAccess::read(address, 4));
        if resp.ok {
            resp.data
        } else {
            0
        }
    }
}

/// Detached stdin→UART pump for non-interactive sessions. Blocks on stdin
/// and dies with the process.
fn spawn_stdin_pump(uart: Arc<UartDevice>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut buffer = [0u8; 64];
        loop {
            match stdin.lock().read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    for &byte in &buffer[..count] {
                        uart.push_rx(byte);
                    }
                }
            }
        }
    });
}
