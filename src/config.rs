//! Emulator configuration: CLI arguments layered over an optional config
//! file.
//!
//! Resolution order: built-in defaults, then the config file (default
//! `emulator.conf`, only required to exist when `--config` names it
//! explicitly), then CLI flags. The file format is line-based `key=value`;
//! `#` and `;` start comments, values may be single- or double-quoted, and
//! integers accept decimal or `0x`-prefixed hexadecimal.

use std::fs;
use std::path::Path;

use log::LevelFilter;
use thiserror::Error;

use crate::logging;

pub const DEFAULT_CONFIG_PATH: &str = "emulator.conf";
pub const DEFAULT_ROM_BASE: u64 = 0x0000_0000;
pub const DEFAULT_UART_BASE: u64 = 0x2000_0000;
pub const DEFAULT_TIMER_BASE: u64 = 0x2000_1000;
pub const DEFAULT_SDL_BASE: u64 = 0x3000_0000;
pub const DEFAULT_RAM_BASE: u64 = 0x8000_0000;
pub const DEFAULT_RAM_SIZE: u64 = 268_435_456;
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const UART_REGION_SIZE: u64 = 0x100;
pub const TIMER_REGION_SIZE: u64 = 0x100;

/// Configuration-phase failure; reported to stderr and exits with code 1.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("option {0} requires a value")]
    MissingValue(String),
    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
    #[error("failed to open config file: {0}")]
    FileOpen(String),
    #[error("invalid config line {0}: missing '='")]
    InvalidLine(usize),
    #[error("unknown config key on line {line}: {key}")]
    UnknownKey { key: String, line: usize },
}

/// Fully resolved emulator configuration.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub rom_path: String,
    pub config_path: String,
    pub debug: bool,
    pub width: u32,
    pub height: u32,
    pub sdl_base: u64,
    pub ram_base: u64,
    pub ram_size: u64,
    pub uart_base: u64,
    pub timer_base: u64,
    pub title: String,
    pub headless: bool,
    pub itrace: bool,
    pub mtrace: bool,
    pub bptrace: bool,
    pub log_level: LevelFilter,
    pub log_filename: Option<String>,
    pub cpu_frequency: u32,
    /// A graceful `HALT` yields exit code 0 when set (the default); clear it
    /// for the strict `kind == None` rule.
    pub ok_on_halt: bool,
    pub show_help: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            rom_path: String::new(),
            config_path: DEFAULT_CONFIG_PATH.to_string(),
            debug: false,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            sdl_base: DEFAULT_SDL_BASE,
            ram_base: DEFAULT_RAM_BASE,
            ram_size: DEFAULT_RAM_SIZE,
            uart_base: DEFAULT_UART_BASE,
            timer_base: DEFAULT_TIMER_BASE,
            title: "Emulator".to_string(),
            headless: false,
            itrace: false,
            mtrace: false,
            bptrace: false,
            log_level: LevelFilter::Info,
            log_filename: None,
            cpu_frequency: 0,
            ok_on_halt: true,
            show_help: false,
        }
    }
}

impl EmulatorConfig {
    /// Full resolution pipeline: defaults, config file, then CLI flags.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let (config_path, explicit) = find_config_path(args)?;
        if let Some(path) = config_path {
            config.config_path = path;
        }
        let path = config.config_path.clone();
        load_config_file(&path, explicit, &mut config)?;
        parse_args(args, &mut config)?;
        Ok(config)
    }
}

/// Parse decimal or `0x`-prefixed hexadecimal.
pub fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u32_value(flag: &str, value: &str) -> Result<u32, ConfigError> {
    parse_u64(value)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ConfigError::InvalidValue { flag: flag.to_string(), value: value.to_string() })
}

fn parse_u64_value(flag: &str, value: &str) -> Result<u64, ConfigError> {
    parse_u64(value)
        .ok_or_else(|| ConfigError::InvalidValue { flag: flag.to_string(), value: value.to_string() })
}

fn parse_level_value(flag: &str, value: &str) -> Result<LevelFilter, ConfigError> {
    logging::parse_level(value)
        .ok_or_else(|| ConfigError::InvalidValue { flag: flag.to_string(), value: value.to_string() })
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Pre-pass over the arguments: locate `--config` (the file must load before
/// the remaining flags override it).
fn find_config_path(args: &[String]) -> Result<(Option<String>, bool), ConfigError> {
    let mut path = None;
    let mut explicit = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
            path = Some(value.clone());
            explicit = true;
        }
    }
    Ok((path, explicit))
}

/// Apply one `key=value` pair from the config file.
fn apply_config_value(
    config: &mut EmulatorConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidValue { flag: key.to_string(), value: value.to_string() };
    match key {
        "rom" => config.rom_path = value.to_string(),
        "title" => config.title = value.to_string(),
        "log_filename" => config.log_filename = Some(value.to_string()),
        "log_level" => config.log_level = parse_level_value(key, value)?,
        "debug" => config.debug = parse_bool(value).ok_or_else(invalid)?,
        "headless" => config.headless = parse_bool(value).ok_or_else(invalid)?,
        "itrace" => config.itrace = parse_bool(value).ok_or_else(invalid)?,
        "mtrace" => config.mtrace = parse_bool(value).ok_or_else(invalid)?,
        "bptrace" => config.bptrace = parse_bool(value).ok_or_else(invalid)?,
        "ok_on_halt" => config.ok_on_halt = parse_bool(value).ok_or_else(invalid)?,
        "width" => config.width = parse_u32_value(key, value)?,
        "height" => config.height = parse_u32_value(key, value)?,
        "cpu_frequency" => config.cpu_frequency = parse_u32_value(key, value)?,
        "ram_base" => config.ram_base = parse_u64_value(key, value)?,
        "ram_size" => config.ram_size = parse_u64_value(key, value)?,
        "uart_base" => config.uart_base = parse_u64_value(key, value)?,
        "timer_base" => config.timer_base = parse_u64_value(key, value)?,
        "sdl_base" => config.sdl_base = parse_u64_value(key, value)?,
        _ => return Err(ConfigError::UnknownKey { key: key.to_string(), line }),
    }
    Ok(())
}

/// Load a `key=value` config file. A missing file is only an error when the
/// path was requested explicitly.
pub fn load_config_file(
    path: impl AsRef<Path>,
    required: bool,
    config: &mut EmulatorConfig,
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) if !required => return Ok(()),
        Err(_) => return Err(ConfigError::FileOpen(path.display().to_string())),
    };
    for (index, raw_line) in contents.lines().enumerate() {
        let line_number = index + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::InvalidLine(line_number));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = unquote(value.trim());
        apply_config_value(config, &key, value, line_number)?;
    }
    Ok(())
}

/// Apply CLI flags over `config`. A bare non-flag argument names the ROM.
pub fn parse_args(args: &[String], config: &mut EmulatorConfig) -> Result<(), ConfigError> {
    fn take_value<'a>(
        flag: &str,
        iter: &mut impl Iterator<Item = &'a String>,
    ) -> Result<String, ConfigError> {
        iter.next()
            .cloned()
            .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
    }

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => config.show_help = true,
            "--config" => config.config_path = take_value(arg, &mut iter)?,
            "--rom" => config.rom_path = take_value(arg, &mut iter)?,
            "--title" => config.title = take_value(arg, &mut iter)?,
            "--debug" => config.debug = true,
            "--headless" => config.headless = true,
            "--itrace" => config.itrace = true,
            "--mtrace" => config.mtrace = true,
            "--bptrace" => config.bptrace = true,
            "--ok-on-halt" => config.ok_on_halt = true,
            "--width" => {
                let value = take_value(arg, &mut iter)?;
                config.width = parse_u32_value(arg, &value)?;
            }
            "--height" => {
                let value = take_value(arg, &mut iter)?;
                config.height = parse_u32_value(arg, &value)?;
            }
            "--cpu-frequency" => {
                let value = take_value(arg, &mut iter)?;
                config.cpu_frequency = parse_u32_value(arg, &value)?;
            }
            "--sdl-base" => {
                let value = take_value(arg, &mut iter)?;
                config.sdl_base = parse_u64_value(arg, &value)?;
            }
            "--ram-base" => {
                let value = take_value(arg, &mut iter)?;
                config.ram_base = parse_u64_value(arg, &value)?;
            }
            "--ram-size" => {
                let value = take_value(arg, &mut iter)?;
                config.ram_size = parse_u64_value(arg, &value)?;
            }
            "--uart-base" => {
                let value = take_value(arg, &mut iter)?;
                config.uart_base = parse_u64_value(arg, &value)?;
            }
            "--timer-base" => {
                let value = take_value(arg, &mut iter)?;
                config.timer_base = parse_u64_value(arg, &value)?;
            }
            "--log-level" => {
                let value = take_value(arg, &mut iter)?;
                config.log_level = parse_level_value(arg, &value)?;
            }
            "--log-filename" => {
                config.log_filename = Some(take_value(arg, &mut iter)?);
            }
            other if other.starts_with('-') => {
                return Err(ConfigError::UnknownOption(other.to_string()));
            }
            other => {
                if config.rom_path.is_empty() {
                    config.rom_path = other.to_string();
                } else {
                    return Err(ConfigError::UnexpectedArgument(other.to_string()));
                }
            }
        }
    }
    Ok(())
}

/// CLI usage text.
pub fn usage(program: &str) -> String {
    format!(
        "Usage: {program} --rom <path> [options]\n\
         \n\
         Options:\n\
         \x20 --config <file>        Load config file (default: emulator.conf)\n\
         \x20 --debug                Start in the interactive debugger\n\
         \x20 --width <pixels>       Display width (default: 640)\n\
         \x20 --height <pixels>      Display height (default: 480)\n\
         \x20 --sdl-base <addr>      Display base address (default: 0x30000000)\n\
         \x20 --ram-base <addr>      RAM base address (default: 0x80000000)\n\
         \x20 --ram-size <bytes>     RAM size (default: 268435456)\n\
         \x20 --uart-base <addr>     UART base address (default: 0x20000000)\n\
         \x20 --timer-base <addr>    Timer base address (default: 0x20001000)\n\
         \x20 --title <string>       Window title (default: Emulator)\n\
         \x20 --headless             Run without a presentation surface\n\
         \x20 --cpu-frequency <hz>   Simulated CPU frequency\n\
         \x20 --itrace               Enable instruction trace\n\
         \x20 --mtrace               Enable memory trace\n\
         \x20 --bptrace              Enable branch prediction trace\n\
         \x20 --ok-on-halt           Treat a graceful HALT as success (default)\n\
         \x20 --log-level <lvl>      trace|debug|info|warn|error (default: info)\n\
         \x20 --log-filename <path>  Device output to <path>.out, logs to <path>.err\n\
         \x20 --help, -h             Show this help\n"
    )
}
