//! Kernel log output.
//!
//! The engine reports through the `log` facade. [`KernelLogger`] formats records into whatever
//! writer the kernel hands it at boot (serial port, VGA buffer); until [`init`] runs every log
//! macro is a no-op.

use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub type LogSink = Box<dyn Write + Send>;

pub struct KernelLogger {
    sink: Mutex<Option<LogSink>>,
}

static LOGGER: KernelLogger = KernelLogger::new();

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Replaces the writer records go to, returning the previous one.
    pub fn set_sink(&self, sink: LogSink) -> Option<LogSink> {
        self.sink.lock().replace(sink)
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.lock().as_mut() {
            // Nothing sensible to do if the console itself fails.
            let _ = writeln!(sink, "[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger, writing records at or above `level` to `sink`.
///
/// Can only succeed once per boot.
pub fn init(level: LevelFilter, sink: LogSink) -> Result<(), SetLoggerError> {
    LOGGER.set_sink(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
