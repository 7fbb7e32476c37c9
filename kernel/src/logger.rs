//! Kernel logger backing the `log` facade.
//!
//! Records go to the VGA console via `println!`; on bare metal they are
//! mirrored to the serial port so logs survive a hung display. The maximum
//! level can be set from the bootloader command line (`loglevel=debug`).

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        println!("[{}] {}: {}", tag, record.target(), record.args());
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        crate::arch::x86::serial::write_fmt(format_args!(
            "[{}] {}: {}\n",
            tag,
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once during early boot.
pub fn init(max_level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}

/// Parse a `loglevel=` directive from the kernel command line.
///
/// Unknown or missing values leave the default (`Info`).
pub fn level_from_cmdline(cmdline: &str) -> LevelFilter {
    for field in cmdline.split_whitespace() {
        if let Some(value) = field.strip_prefix("loglevel=") {
            return match value {
                "off" => LevelFilter::Off,
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                _ => LevelFilter::Info,
            };
        }
    }
    LevelFilter::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_selects_level() {
        assert_eq!(level_from_cmdline("root=/dev/hda1 loglevel=debug"), LevelFilter::Debug);
        assert_eq!(level_from_cmdline("loglevel=off"), LevelFilter::Off);
    }

    #[test]
    fn cmdline_defaults_to_info() {
        assert_eq!(level_from_cmdline(""), LevelFilter::Info);
        assert_eq!(level_from_cmdline("loglevel=bogus"), LevelFilter::Info);
        assert_eq!(level_from_cmdline("quiet splash"), LevelFilter::Info);
    }
}
