//! Real-time clock driver with per-process rate virtualisation.
//!
//! The hardware ticks once, at 1024 Hz; a single global counter advances
//! on every interrupt. Each process carries a virtual rate in its PCB and
//! a blocking RTC read simply waits until `hw_rate / virtual_rate` global
//! ticks have elapsed. Writing the RTC file validates and stores a new
//! virtual rate; the hardware is never reprogrammed after boot.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    arch::{self, port},
    drivers::pic,
    error::{KernelError, KernelResult},
    irq, process,
};

/// Register-A divider setting: interrupt rate is `32768 >> (RATE - 1)`.
const HW_RATE_SELECT: u8 = 6;
/// Hardware interrupt frequency in Hz.
pub const HW_FREQ: u32 = 32768 >> (HW_RATE_SELECT - 1);
/// Highest virtual rate a process may request.
pub const MAX_VIRTUAL_RATE: u32 = 1024;
/// One hardware tick in microseconds.
pub const TICK_PERIOD_USEC: u64 = 976;

const RTC_PORT: u16 = 0x70;
const CMOS_PORT: u16 = 0x71;
const REG_A: u8 = 0x0A;
const REG_B: u8 = 0x0B;
const REG_C: u8 = 0x0C;
/// High bit of the index port gates NMI while a register is selected.
const DISABLE_NMI: u8 = 0x80;
/// Register B: periodic-interrupt enable.
const PERIODIC_ENABLE: u8 = 0x40;
const RATE_MASK: u8 = 0xF0;

/// Global tick counter; monotonic, wide enough that the short deltas used
/// here never wrap.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program periodic interrupts at the hardware rate and unmask IRQ 8.
pub fn init() {
    pic::disable_irq(pic::RTC_LINE);
    unsafe {
        port::outb(RTC_PORT, REG_B | DISABLE_NMI);
        let reg = port::inb(CMOS_PORT);
        port::outb(RTC_PORT, REG_B | DISABLE_NMI);
        port::outb(CMOS_PORT, reg | PERIODIC_ENABLE);

        port::outb(RTC_PORT, REG_A | DISABLE_NMI);
        let reg = port::inb(CMOS_PORT);
        port::outb(RTC_PORT, REG_A | DISABLE_NMI);
        port::outb(CMOS_PORT, HW_RATE_SELECT | (reg & RATE_MASK));
    }
    TICKS.store(0, Ordering::Relaxed);
    irq::install_handler(irq::RTC_VECTOR, rtc_irq);
    pic::enable_irq(pic::RTC_LINE);
    log::info!("rtc: periodic tick at {} Hz", HW_FREQ);
}

/// IRQ 8 handler: count the tick and acknowledge register C so the chip
/// raises the next one.
pub fn rtc_irq() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    unsafe {
        port::outb(RTC_PORT, REG_C);
        let _ = port::inb(CMOS_PORT);
    }
}

/// Current global tick count.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// A usable virtual rate: a non-zero power of two no faster than the
/// hardware.
pub fn is_valid_rate(rate: u32) -> bool {
    rate != 0 && rate.is_power_of_two() && rate <= MAX_VIRTUAL_RATE
}

/// Hardware ticks per virtual tick at `rate`.
pub fn ticks_to_wait(rate: u32) -> u64 {
    u64::from(HW_FREQ / rate)
}

/// Store a new virtual rate in the calling process' PCB.
pub fn set_virtual_rate(rate: u32) -> KernelResult<()> {
    if !is_valid_rate(rate) {
        return Err(KernelError::InvalidArgument);
    }
    process::with_current(|pcb| pcb.rtc_rate = rate)?;
    Ok(())
}

/// Virtual rate of the calling process (boot context reads the default).
pub fn virtual_rate() -> u32 {
    process::with_current(|pcb| pcb.rtc_rate).unwrap_or(process::DEFAULT_RTC_RATE)
}

/// Block until the next virtual tick at the caller's rate.
pub fn virtual_read() -> KernelResult<()> {
    let wait = ticks_to_wait(virtual_rate());
    let start = ticks();
    arch::enable_interrupts();
    while ticks().wrapping_sub(start) < wait {
        core::hint::spin_loop();
    }
    Ok(())
}

/// Spin for at least `usecs` microseconds; rejects delays shorter than
/// one hardware tick.
pub fn udelay(usecs: u64) -> KernelResult<()> {
    if usecs < TICK_PERIOD_USEC {
        return Err(KernelError::InvalidArgument);
    }
    let wait = usecs / TICK_PERIOD_USEC;
    let start = ticks();
    while ticks().wrapping_sub(start) < wait {
        core::hint::spin_loop();
    }
    Ok(())
}

/// Millisecond convenience wrapper over [`udelay`].
pub fn delay_ms(msecs: u64) -> KernelResult<()> {
    udelay(msecs * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_rate_is_1024() {
        assert_eq!(HW_FREQ, 1024);
    }

    #[test]
    fn rate_validation() {
        assert!(is_valid_rate(2));
        assert!(is_valid_rate(64));
        assert!(is_valid_rate(1024));
        assert!(!is_valid_rate(0));
        assert!(!is_valid_rate(3));
        assert!(!is_valid_rate(2048));
    }

    #[test]
    fn wait_ticks_scale_inversely_with_rate() {
        assert_eq!(ticks_to_wait(2), 512);
        assert_eq!(ticks_to_wait(64), 16);
        assert_eq!(ticks_to_wait(1024), 1);
    }

    #[test]
    fn irq_advances_the_counter() {
        let before = ticks();
        rtc_irq();
        rtc_irq();
        assert_eq!(ticks() - before, 2);
    }

    #[test]
    fn short_delays_are_rejected() {
        assert!(udelay(10).is_err());
    }

    #[test]
    fn set_rate_needs_a_process_and_a_valid_value() {
        let _guard = crate::test_lock();
        process::init();
        assert!(set_virtual_rate(64).is_err()); // no current process
        let pid = process::allocate_pid().unwrap();
        process::with_slot(pid, |pcb| {
            pcb.in_use = true;
            pcb.pid = pid;
        })
        .unwrap();
        process::set_current(Some(pid));
        assert!(set_virtual_rate(3).is_err());
        assert!(set_virtual_rate(64).is_ok());
        assert_eq!(virtual_rate(), 64);
        process::set_current(None);
        process::init();
    }
}
