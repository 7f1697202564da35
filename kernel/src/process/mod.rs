//! Process model: the PCB arena, kernel stacks, and the current-process
//! cell.
//!
//! PCBs live in a fixed arena of 8 slots indexed by pid. Each pid also
//! owns one 8 KiB kernel stack; `esp0` in the TSS always points at the
//! current process' stack top. The scheduler and `execute`/`halt` are the
//! only writers of the current-process cell, and every arena access runs
//! inside an interrupts-off critical section on this single-CPU system.

pub mod pid;

use core::sync::atomic::{AtomicI32, Ordering};

use spin::Mutex;

use crate::{
    arch::{self, KernelContext},
    error::{KernelError, KernelResult, ProcError},
    fs::file::File,
};
pub use pid::{PidHeap, MAX_PIDS};

/// File-descriptor slots per process.
pub const MAX_OPEN_FILES: usize = 8;
/// Longest accepted command line (including argv).
pub const MAX_COMMAND_LEN: usize = 128;
/// Virtual RTC rate every new process starts with.
pub const DEFAULT_RTC_RATE: u32 = 2;
/// Status the parent observes when a child died on an exception; outside
/// the 0–255 range a user exit can produce.
pub const CRASH_STATUS: u32 = 256;
/// Kernel stack bytes per process.
pub const KERNEL_STACK_SIZE: usize = 8192;

/// Terminal binding: inherit the parent's terminal.
pub const INHERIT_TTY: i32 = -2;
/// Terminal binding: no terminal at all.
pub const HEADLESS_TTY: i32 = -1;

/// Per-process control block.
#[derive(Clone, Copy)]
pub struct Pcb {
    /// Slot is occupied by a live process.
    pub in_use: bool,
    /// This process' id (== arena index).
    pub pid: usize,
    /// Parent pid; a root process is its own parent.
    pub parent: usize,
    /// Parent's saved `execute` frame; `halt` resumes it.
    pub parent_context: KernelContext,
    /// Filtered command line (single-spaced argv).
    pub command: [u8; MAX_COMMAND_LEN],
    /// Length of `command`.
    pub command_len: usize,
    /// Open-file table; fds 0 and 1 are the terminal and are always
    /// present while the process lives.
    pub files: [File; MAX_OPEN_FILES],
    /// This process' virtual RTC rate in Hz.
    pub rtc_rate: u32,
    /// Set when the process died on a CPU exception.
    pub crashed: bool,
    /// Bound terminal, or [`HEADLESS_TTY`].
    pub tid: i32,
    /// When false, `halt` re-executes the command instead of tearing the
    /// process down (root shells).
    pub haltable: bool,
    /// Exit status the child stores just before control returns to our
    /// `execute` frame.
    pub child_status: u32,
}

impl Pcb {
    const fn vacant() -> Self {
        Self {
            in_use: false,
            pid: 0,
            parent: 0,
            parent_context: KernelContext::empty(),
            command: [0; MAX_COMMAND_LEN],
            command_len: 0,
            files: [File::closed(); MAX_OPEN_FILES],
            rtc_rate: DEFAULT_RTC_RATE,
            crashed: false,
            tid: HEADLESS_TTY,
            haltable: true,
            child_status: 0,
        }
    }
}

static PROCESS_TABLE: Mutex<[Pcb; MAX_PIDS]> = Mutex::new([Pcb::vacant(); MAX_PIDS]);
static FREE_PIDS: Mutex<PidHeap> = Mutex::new(PidHeap::full());

/// Pid of the process currently owning the CPU, or -1 during boot.
static CURRENT_PID: AtomicI32 = AtomicI32::new(-1);

/// Reset the arena, the pid heap, and the current cell to boot state.
pub fn init() {
    arch::without_interrupts(|| {
        *PROCESS_TABLE.lock() = [Pcb::vacant(); MAX_PIDS];
        *FREE_PIDS.lock() = PidHeap::full();
        CURRENT_PID.store(-1, Ordering::Relaxed);
    });
}

/// Take the smallest free pid.
pub fn allocate_pid() -> KernelResult<usize> {
    arch::without_interrupts(|| {
        FREE_PIDS
            .lock()
            .pop()
            .map(|pid| pid as usize)
            .ok_or(KernelError::Proc(ProcError::NoFreePid))
    })
}

/// Return `pid` to the free heap and vacate its arena slot.
pub fn release_pid(pid: usize) {
    arch::without_interrupts(|| {
        if pid < MAX_PIDS {
            PROCESS_TABLE.lock()[pid].in_use = false;
            FREE_PIDS.lock().insert(pid as i32);
        }
    });
}

/// Number of free pids (test and diagnostics hook).
pub fn free_pid_count() -> usize {
    arch::without_interrupts(|| FREE_PIDS.lock().len())
}

/// Whether `pid` currently sits in the free heap.
pub fn pid_is_free(pid: usize) -> bool {
    arch::without_interrupts(|| FREE_PIDS.lock().contains(pid as i32))
}

/// Pid of the current process, if any.
pub fn current_pid() -> Option<usize> {
    let pid = CURRENT_PID.load(Ordering::Relaxed);
    (pid >= 0).then_some(pid as usize)
}

/// Install `pid` as the current process (scheduler / execute / halt only).
pub fn set_current(pid: Option<usize>) {
    CURRENT_PID.store(pid.map_or(-1, |p| p as i32), Ordering::Relaxed);
}

/// Run `f` against `pid`'s arena slot (live or not) under the table lock.
pub fn with_slot<R>(pid: usize, f: impl FnOnce(&mut Pcb) -> R) -> KernelResult<R> {
    if pid >= MAX_PIDS {
        return Err(KernelError::Proc(ProcError::NoSuchProcess));
    }
    Ok(arch::without_interrupts(|| f(&mut PROCESS_TABLE.lock()[pid])))
}

/// Run `f` against `pid`'s PCB; fails unless the slot is live.
pub fn with_pcb<R>(pid: usize, f: impl FnOnce(&mut Pcb) -> R) -> KernelResult<R> {
    if pid >= MAX_PIDS {
        return Err(KernelError::Proc(ProcError::NoSuchProcess));
    }
    arch::without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let pcb = &mut table[pid];
        if !pcb.in_use {
            return Err(KernelError::Proc(ProcError::NoSuchProcess));
        }
        Ok(f(pcb))
    })
}

/// Run `f` against the current process' PCB.
pub fn with_current<R>(f: impl FnOnce(&mut Pcb) -> R) -> KernelResult<R> {
    let pid = current_pid().ok_or(KernelError::Proc(ProcError::NoSuchProcess))?;
    with_pcb(pid, f)
}

/// (pid, parent) of the current process, for diagnostics.
pub fn current_identity() -> Option<(usize, usize)> {
    with_current(|pcb| (pcb.pid, pcb.parent)).ok()
}

/// Flag the current process as crashed; `halt` will report
/// [`CRASH_STATUS`] to the parent regardless of the status argument.
pub fn mark_current_crashed() {
    let _ = with_current(|pcb| pcb.crashed = true);
}

/// Terminal the current process is bound to, or [`HEADLESS_TTY`] when
/// there is no process yet.
pub fn current_tid() -> i32 {
    with_current(|pcb| pcb.tid).unwrap_or(HEADLESS_TTY)
}

// ---------------------------------------------------------------------------
// Kernel stacks
// ---------------------------------------------------------------------------

#[repr(C, align(8192))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

static mut KERNEL_STACKS: [KernelStack; MAX_PIDS] = [
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
    KernelStack([0; KERNEL_STACK_SIZE]),
];

/// Initial stack pointer for `pid`'s kernel stack (last dword, like the
/// user stack).
pub fn kernel_stack_top(pid: usize) -> u32 {
    debug_assert!(pid < MAX_PIDS);
    // SAFETY: address computation only; the stack memory itself is only
    // ever touched by the CPU while the pid owns it.
    let base = unsafe { core::ptr::addr_of!(KERNEL_STACKS[pid]) as usize };
    (base + KERNEL_STACK_SIZE - 4) as u32
}
