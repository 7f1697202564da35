//! Cerulean kernel library.
//!
//! A small protected-mode, single-processor kernel for x86 PC-class
//! machines: flat paging with a per-process 4 MiB user window, a 256-gate
//! interrupt dispatcher, a read-only file system, three virtual terminals
//! plus a headless one, a round-robin scheduler on the PIT tick, and an
//! `int 0x80` system-call surface.
//!
//! On bare metal (`target_os = "none"`) this is the real kernel; on a
//! host target the hardware layer compiles to stubs and the logic is
//! exercised by the standard test harness.

#![no_std]

// Host target: the system allocator and std exist, so unit tests can use
// them; the kernel proper never allocates.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod tty;

#[cfg(test)]
mod integration_tests;

/// Serialises tests that touch the kernel's process-wide singletons (the
/// console, the PCB arena, the scheduler tables, the mounted image).
#[cfg(test)]
pub fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
