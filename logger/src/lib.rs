//! A minimal [`log::Log`] backend over a 16550 UART (§4.8).
//!
//! The memory management core never touches a display or serial port
//! directly; every allocator calls through `trace!`/`debug!`/`info!`/
//! `warn!`/`error!`. This crate is the one place that turns those calls into
//! bytes on the wire, and it is installed before anything else in the core
//! — including the region reserver — so that every later bootstrap step can
//! be traced, failures included.

#![no_std]

use core::fmt::Write;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use uart_16550::SerialPort;

/// The standard I/O port of the first serial interface on PC-compatible
/// hardware, which QEMU and most real machines wire up by default.
const COM1_PORT: u16 = 0x3F8;

struct UartLogger {
    port: Mutex<SerialPort>,
}

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = self.port.lock();
        let _ = writeln!(
            port,
            "[{:>5}] {}:{} -- {}",
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger { port: Mutex::new(unsafe { SerialPort::new(COM1_PORT) }) };

/// Initializes the UART and installs [`LOGGER`] as the global `log` backend.
///
/// Must be called exactly once, as early in bootstrap as possible: before
/// `region_reserver::init`, so that every subsequent allocator
/// initialization step is traceable.
pub fn init(max_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.port.lock().init();
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}
