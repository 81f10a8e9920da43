//! Kernel logging backend for the `log` crate.
//!
//! Records go to COM1 unconditionally; Info and above are mirrored to the
//! VGA console so boot diagnostics are visible without a serial capture.
//! Installed once, early in boot, before memory management comes up --
//! the logger itself never allocates.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::error::{KernelError, KernelResult};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        serial_println!(
            "[{:5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );

        if record.level() <= Level::Info {
            println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Must be called once, before any subsystem
/// that logs is initialised.
pub fn init() -> KernelResult<()> {
    log::set_logger(&LOGGER).map_err(|_| KernelError::AlreadyExists { resource: "logger" })?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}
