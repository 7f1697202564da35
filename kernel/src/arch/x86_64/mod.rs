//! x86 CPU support: interrupt-flag control, halt, segment selectors.
//!
//! Real implementations are compiled only for bare metal
//! (`target_os = "none"`); host builds get inert stubs so unit tests can
//! drive the kernel's logic without executing privileged instructions.

pub mod context;
pub mod port;
pub mod tss;
pub mod usermode;

/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x0010;
/// Kernel data/stack segment selector.
pub const KERNEL_DS: u16 = 0x0018;
/// User code segment selector (RPL 3).
pub const USER_CS: u16 = 0x0023;
/// User data/stack segment selector (RPL 3).
pub const USER_DS: u16 = 0x002B;

/// One-time CPU setup. Nothing to do beyond what the boot path already
/// established; kept as the architecture hook the boot sequence calls.
pub fn init() {}

// ---------------------------------------------------------------------------
// Bare-metal implementation
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    /// Run `f` with the interrupt flag cleared, restoring the previous
    /// flag state afterwards.
    pub fn without_interrupts<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        ::x86_64::instructions::interrupts::without_interrupts(f)
    }

    /// Set the interrupt flag.
    pub fn enable_interrupts() {
        ::x86_64::instructions::interrupts::enable();
    }

    /// Clear the interrupt flag.
    pub fn disable_interrupts() {
        ::x86_64::instructions::interrupts::disable();
    }

    /// Low-power spin: `hlt` until the next interrupt, forever.
    pub fn halt_loop() -> ! {
        loop {
            ::x86_64::instructions::hlt();
        }
    }

    /// Faulting linear address of the last page fault.
    pub fn read_cr2() -> u32 {
        use ::x86_64::registers::control::Cr2;
        Cr2::read_raw() as u32
    }
}

// ---------------------------------------------------------------------------
// Host stubs (unit tests)
// ---------------------------------------------------------------------------

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    /// Host stub: interrupt masking is meaningless off bare metal.
    pub fn without_interrupts<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        f()
    }

    /// Host stub.
    pub fn enable_interrupts() {}

    /// Host stub.
    pub fn disable_interrupts() {}

    /// Host stub: tests must never reach the halt loop.
    pub fn halt_loop() -> ! {
        panic!("halt_loop reached in host build");
    }

    /// Host stub.
    pub fn read_cr2() -> u32 {
        0
    }
}

pub use imp::{disable_interrupts, enable_interrupts, halt_loop, read_cr2, without_interrupts};
