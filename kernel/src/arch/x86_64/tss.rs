//! Task-state-segment bookkeeping.
//!
//! The boot path builds the GDT and the hardware TSS; the kernel's only
//! ongoing contract with it is `esp0`/`ss0`: the ring-0 stack the CPU loads
//! on a privilege transition must always reference the kernel stack of the
//! current process. The scheduler and `execute`/`halt` update it through
//! [`set_kernel_stack`].

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use super::KERNEL_DS;

static ESP0: AtomicU32 = AtomicU32::new(0);
static SS0: AtomicU16 = AtomicU16::new(KERNEL_DS);

/// Point the TSS ring-0 stack at `esp0` in segment `ss0`.
pub fn set_kernel_stack(esp0: u32, ss0: u16) {
    ESP0.store(esp0, Ordering::Relaxed);
    SS0.store(ss0, Ordering::Relaxed);
    sync_hardware(esp0, ss0);
}

/// Current `esp0` value.
pub fn kernel_stack() -> u32 {
    ESP0.load(Ordering::Relaxed)
}

/// Current `ss0` value.
pub fn kernel_stack_segment() -> u16 {
    SS0.load(Ordering::Relaxed)
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn sync_hardware(esp0: u32, ss0: u16) {
    // The boot stub exports the live TSS; patch the ring-0 stack fields in
    // place. The TSS stays loaded in TR the whole time, so no ltr is needed.
    extern "C" {
        static mut BOOT_TSS_ESP0: u32;
        static mut BOOT_TSS_SS0: u32;
    }
    unsafe {
        core::ptr::write_volatile(core::ptr::addr_of_mut!(BOOT_TSS_ESP0), esp0);
        core::ptr::write_volatile(core::ptr::addr_of_mut!(BOOT_TSS_SS0), ss0 as u32);
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn sync_hardware(_esp0: u32, _ss0: u16) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_stack_round_trips() {
        set_kernel_stack(0x0080_0000 - 4, KERNEL_DS);
        assert_eq!(kernel_stack(), 0x0080_0000 - 4);
        assert_eq!(kernel_stack_segment(), KERNEL_DS);
    }
}
