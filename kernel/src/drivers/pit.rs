//! Programmable interval timer: the scheduler tick source.
//!
//! Channel 0 is programmed as a square-wave generator (mode 3) at
//! [`SCHEDULER_HZ`]; the scheduler installs its handler on the PIT vector
//! before this driver unmasks the line.

use crate::{arch::port, drivers::pic};

/// Scheduler tick rate.
pub const SCHEDULER_HZ: u32 = 50;

/// The PIT input clock in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

const CHANNEL_0: u16 = 0x40;
const COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const MODE3_LOHI: u8 = 0x36;

/// Reload value for a desired output frequency. The 8254 treats 0 as
/// 65536, which is also the slowest rate we can ask for.
pub fn reload_value(hz: u32) -> u16 {
    if hz == 0 {
        return 0;
    }
    let divisor = PIT_FREQUENCY / hz;
    if divisor > u16::MAX as u32 {
        0
    } else {
        divisor as u16
    }
}

/// Program channel 0 and unmask the tick line.
pub fn init() {
    pic::disable_irq(pic::PIT_LINE);
    let reload = reload_value(SCHEDULER_HZ);
    unsafe {
        port::outb(COMMAND, MODE3_LOHI);
        port::outb(CHANNEL_0, (reload & 0xFF) as u8);
        port::outb(CHANNEL_0, (reload >> 8) as u8);
    }
    pic::enable_irq(pic::PIT_LINE);
    log::info!("pit: scheduler tick at {} Hz", SCHEDULER_HZ);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_hertz_reload() {
        // 1193182 / 50 = 23863
        assert_eq!(reload_value(SCHEDULER_HZ), 23863);
    }

    #[test]
    fn slow_rates_saturate_to_max_period() {
        assert_eq!(reload_value(1), 0);
        assert_eq!(reload_value(0), 0);
    }

    #[test]
    fn fast_rates_fit() {
        assert_eq!(reload_value(1000), 1193);
    }
}
