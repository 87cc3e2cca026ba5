//! soc-emu: modular SoC emulator host.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use soc_emu::config::{self, EmulatorConfig};
use soc_emu::emulator;
use soc_emu::logging;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let program = "soc-emu";

    let config = match EmulatorConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            eprint!("{}", config::usage(program));
            return ExitCode::from(1);
        }
    };
    if config.show_help {
        print!("{}", config::usage(program));
        return ExitCode::SUCCESS;
    }
    if config.rom_path.is_empty() {
        eprintln!("error: ROM path is required");
        eprint!("{}", config::usage(program));
        return ExitCode::from(1);
    }

    let log_file: Option<PathBuf> = config
        .log_filename
        .as_ref()
        .map(|prefix| PathBuf::from(format!("{prefix}.err")));
    if let Err(err) = logging::init(config.log_level, log_file.as_deref()) {
        eprintln!("error: {err}");
        return ExitCode::from(1);
    }

    match emulator::run(&config) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
