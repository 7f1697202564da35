//! Serial diagnostics sink and the `log` facade wiring.
//!
//! Kernel messages go to COM1 so they survive terminal switches and show
//! up on the QEMU `-serial stdio` console. On host builds the sink is
//! standard error, which keeps `log` output visible under `cargo test`.

use core::fmt;

use log::{LevelFilter, Metadata, Record};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod sink {
    use core::fmt;

    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        static ref COM1: Mutex<SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 base; nothing else in the
            // kernel drives these ports.
            let mut port = unsafe { SerialPort::new(0x3F8) };
            port.init();
            Mutex::new(port)
        };
    }

    pub fn write_fmt(args: fmt::Arguments) {
        use core::fmt::Write;
        COM1.lock().write_fmt(args).ok();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod sink {
    use core::fmt;

    pub fn write_fmt(args: fmt::Arguments) {
        ::std::eprint!("{}", args);
    }
}

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            sink::write_fmt(format_args!(
                "[{:5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Safe to call more than once; later calls
/// keep the first registration.
pub fn init_logging() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raw serial output, independent of the `log` level gate.
pub fn write_fmt(args: fmt::Arguments) {
    sink::write_fmt(args);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_installs_once() {
        init_logging();
        init_logging();
        log::info!("logger smoke test");
    }
}
