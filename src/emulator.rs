//! Host wiring: build the machine from the configured address plan and run
//! it under the debugger.

use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::bus::{validate_regions, MemoryBus, MemoryRegion};
use crate::config::{
    EmulatorConfig, DEFAULT_ROM_BASE, TIMER_REGION_SIZE, UART_REGION_SIZE,
};
use crate::cpu::{CpuExecutor, FaultInfo, FaultKind, ToyCpu};
use crate::debugger::Debugger;
use crate::device::display::BYTES_PER_PIXEL;
use crate::device::{
    Device, DisplayDevice, MemoryDevice, PresentationSurface, TimerDevice, UartDevice,
};
use crate::logging;
use crate::trace::TraceOptions;

/// The wired SoC: bus plus strong references to every device.
pub struct Machine {
    pub bus: Arc<MemoryBus>,
    pub rom: Arc<MemoryDevice>,
    pub ram: Arc<MemoryDevice>,
    pub uart: Arc<UartDevice>,
    pub timer: Arc<TimerDevice>,
    pub display: Arc<DisplayDevice>,
}

/// Framebuffer byte size with overflow checking.
fn framebuffer_size(width: u32, height: u32) -> Option<u64> {
    let pixels = u64::from(width).checked_mul(u64::from(height))?;
    pixels.checked_mul(u64::from(BYTES_PER_PIXEL))
}

/// The address plan the host validates before the bus starts serving.
pub fn build_address_plan(
    config: &EmulatorConfig,
    rom_size: u64,
    display_size: u64,
) -> Vec<MemoryRegion> {
    vec![
        MemoryRegion::new("ROM", DEFAULT_ROM_BASE, rom_size),
        MemoryRegion::new("UART", config.uart_base, UART_REGION_SIZE),
        MemoryRegion::new("TIMER", config.timer_base, TIMER_REGION_SIZE),
        MemoryRegion::new("SDL", config.sdl_base, display_size),
        MemoryRegion::new("RAM", config.ram_base, config.ram_size),
    ]
}

/// Construct and wire all devices. Refuses overlapping or malformed plans.
pub fn build_machine(
    config: &EmulatorConfig,
    surface: Option<Box<dyn PresentationSurface>>,
) -> Result<Machine> {
    if config.rom_path.is_empty() {
        bail!("ROM path is required");
    }
    if config.width == 0 || config.height == 0 {
        bail!("display width/height must be non-zero");
    }
    let rom_size = fs::metadata(&config.rom_path)
        .with_context(|| format!("read ROM file {}", config.rom_path))?
        .len();
    if rom_size == 0 {
        bail!("ROM file {} is empty", config.rom_path);
    }
    let fb_size = framebuffer_size(config.width, config.height)
        .context("display size overflows")?;
    let display = match surface {
        Some(surface) => DisplayDevice::with_surface(config.width, config.height, surface),
        None => DisplayDevice::new(config.width, config.height),
    };
    let display = Arc::new(display);
    debug_assert_eq!(display.framebuffer_size(), fb_size);

    let plan = build_address_plan(config, rom_size, display.mapped_size());
    validate_regions(&plan).context("invalid address plan")?;

    let rom = Arc::new(MemoryDevice::new(rom_size, true));
    rom.load_image(&config.rom_path, 0)
        .with_context(|| format!("load ROM image {}", config.rom_path))?;
    let ram = Arc::new(MemoryDevice::new(config.ram_size, false));
    let uart = Arc::new(UartDevice::new());
    let timer = Arc::new(TimerDevice::new());

    match &config.log_filename {
        Some(prefix) => uart.set_sink(logging::file_sink(format!("{prefix}.out"))?),
        None => uart.set_sink(logging::stdout_sink()),
    }

    let mut bus = MemoryBus::new();
    bus.register(Arc::clone(&rom) as Arc<dyn Device>, DEFAULT_ROM_BASE, rom_size, "ROM");
    bus.register(Arc::clone(&uart) as Arc<dyn Device>, config.uart_base, UART_REGION_SIZE, "UART");
    bus.register(Arc::clone(&timer) as Arc<dyn Device>, config.timer_base, TIMER_REGION_SIZE, "TIMER");
    bus.register(Arc::clone(&display) as Arc<dyn Device>, config.sdl_base, display.mapped_size(), "SDL");
    bus.register(Arc::clone(&ram) as Arc<dyn Device>, config.ram_base, config.ram_size, "RAM");

    Ok(Machine { bus: Arc::new(bus), rom, ram, uart, timer, display })
}

/// Exit-code rule: 0 for a clean run, and for a graceful halt when
/// `ok_on_halt` is set; 1 for every fault.
pub fn exit_code(error: &FaultInfo, ok_on_halt: bool) -> i32 {
    match error.kind {
        FaultKind::None => 0,
        FaultKind::Halt if ok_on_halt => 0,
        _ => 1,
    }
}

/// Run a full session with an explicit (possibly absent) surface backend.
pub fn run_with_surface(
    config: &EmulatorConfig,
    surface: Option<Box<dyn PresentationSurface>>,
) -> Result<i32> {
    if surface.is_none() && !config.headless {
        log::warn!("no presentation surface backend available; running headless");
    }
    let machine = build_machine(config, surface)?;

    let mut cpu = ToyCpu::new();
    cpu.reset();
    cpu.set_pc(DEFAULT_ROM_BASE);

    let mut debugger = Debugger::new(Box::new(cpu), Arc::clone(&machine.bus));
    debugger.set_uart(Arc::clone(&machine.uart));
    debugger.set_display(Arc::clone(&machine.display));
    debugger.set_cpu_frequency(config.cpu_frequency);
    debugger.configure_trace(TraceOptions {
        log_instruction: config.itrace,
        log_mem_events: config.mtrace,
        log_branch_prediction: config.bptrace,
    });

    debugger.run(config.debug);

    let error = debugger.last_error();
    let code = exit_code(&error, config.ok_on_halt);
    log::info!(
        "session finished: last error {} at 0x{:x}, exit code {}",
        error.kind,
        error.address,
        code
    );
    Ok(code)
}

/// Run a session with the default (headless) backend.
pub fn run(config: &EmulatorConfig) -> Result<i32> {
    run_with_surface(config, None)
}
