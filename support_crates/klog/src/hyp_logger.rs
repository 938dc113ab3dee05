//! A logging implementation which writes records to the hypervisor debug console
use core::fmt::Write;

use crate::console::{Console, ConsoleWriter};
use ksync::SpinLock;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// A [`Log`] implementation that formats records onto a [`Console`].
///
/// The logger can be installed before any console is usable; records are dropped until one is attached with
/// [`attach_console()`](HypLogger::attach_console).
/// This matters because the debug console only becomes accessible once it has been mapped into the hypervisor
/// address space.
pub struct HypLogger<C: Console> {
    pub initial_log_level: Level,
    console: SpinLock<Option<C>>,
}

impl<C: Console> HypLogger<C> {
    pub const fn new(max_log_level: Level) -> Self {
        Self {
            initial_log_level: max_log_level,
            console: SpinLock::new(None),
        }
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self).map(|_| log::set_max_level(self.initial_log_level.to_level_filter()))
    }

    pub fn update_log_level(&self, level: Level) {
        log::set_max_level(level.to_level_filter());
    }

    /// Start writing records to `console`, returning the previously attached one
    pub fn attach_console(&self, console: C) -> Option<C> {
        self.console.spin_lock().replace(console)
    }

    /// Stop writing records anywhere, returning the previously attached console
    pub fn detach_console(&self) -> Option<C> {
        self.console.spin_lock().take()
    }
}

impl<C: Console> Log for HypLogger<C> {
    /// Filtering is left to the global maximum level of [`log`] which [`install()`](HypLogger::install) and
    /// [`update_log_level()`](HypLogger::update_log_level) set.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut console = self.console.spin_lock();
        if let Some(console) = console.as_mut() {
            let level = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            // a console cannot fail and there is nowhere else to report to
            let _ = ConsoleWriter(console).write_fmt(format_args!(
                "[{}] {}: {}\n",
                level,
                record.target(),
                record.args(),
            ));
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use std::string::String;
    use std::vec::Vec;

    struct Buffer(Vec<u8>);

    impl Console for Buffer {
        fn write_byte(&mut self, byte: u8) {
            self.0.push(byte);
        }
    }

    fn log_to(logger: &HypLogger<Buffer>, level: Level, msg: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("hypervisor::mmu_hyp")
                .args(format_args!("{}", msg))
                .build(),
        );
    }

    #[test]
    fn test_records_are_dropped_without_console() {
        let logger = HypLogger::<Buffer>::new(Level::Trace);
        log_to(&logger, Level::Info, "lost");
        assert!(logger.detach_console().is_none());
    }

    #[test]
    fn test_record_format() {
        let logger = HypLogger::new(Level::Info);
        logger.attach_console(Buffer(Vec::new()));
        log_to(&logger, Level::Warn, "VA->PA check failed");
        let out = String::from_utf8(logger.detach_console().unwrap().0).unwrap();
        assert_eq!(out, "[WARN ] hypervisor::mmu_hyp: VA->PA check failed\r\n");
    }

    #[test]
    fn test_initial_level_does_not_cap_later_updates() {
        let logger = HypLogger::new(Level::Info);
        assert!(logger.enabled(&Metadata::builder().level(Level::Trace).build()));
        logger.attach_console(Buffer(Vec::new()));
        log_to(&logger, Level::Debug, "walk");
        let out = String::from_utf8(logger.detach_console().unwrap().0).unwrap();
        assert_eq!(out, "[DEBUG] hypervisor::mmu_hyp: walk\r\n");
    }
}
