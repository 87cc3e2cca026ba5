//! Log facade setup and output sinks.
//!
//! Diagnostics go through the `log` crate; the backend is an `env_logger`
//! builder configured for runtime level changes: the logger itself passes
//! everything and `log::set_max_level` is the effective filter, which also
//! implements the debug shell's `log <level>` command.
//!
//! Device output (UART TX) is kept apart from diagnostics. It flows through
//! an injectable [`DeviceSink`]; with `--log-filename <prefix>` the host
//! routes device bytes to `<prefix>.out` and diagnostics to `<prefix>.err`,
//! otherwise stdout/stderr.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::LevelFilter;

/// Consumer of raw device output bytes (UART TX flushes).
pub type DeviceSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Parse a CLI/config log level name.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// Initialize the global logger.
///
/// `log_file` redirects diagnostics away from stderr. Safe to call once per
/// process; later calls fail, which tests tolerate by ignoring the error.
pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Trace);
    builder.format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder
        .try_init()
        .map_err(|e| anyhow::anyhow!("logger already initialized: {e}"))?;
    log::set_max_level(level);
    Ok(())
}

/// Change the effective level at runtime.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Sink writing device output to stdout, flushed per blob.
pub fn stdout_sink() -> DeviceSink {
    Arc::new(|bytes: &[u8]| {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        let _ = handle.write_all(bytes);
        let _ = handle.flush();
    })
}

/// Sink appending device output to a file, flushed per blob.
pub fn file_sink(path: impl AsRef<Path>) -> Result<DeviceSink> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("create device output file {}", path.display()))?;
    let file = Mutex::new(file);
    Ok(Arc::new(move |bytes: &[u8]| {
        let mut file = file.lock().unwrap();
        let _ = file.write_all(bytes);
        let _ = file.flush();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(parse_level("info"), Some(LevelFilter::Info));
        assert_eq!(parse_level("TRACE"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("Warn"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("verbose"), None);
        assert_eq!(parse_level(""), None);
    }

    #[test]
    fn file_sink_appends_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.out");
        let sink = file_sink(&path).unwrap();
        sink(b"OK");
        sink(b"\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"OK\n");
    }
}
