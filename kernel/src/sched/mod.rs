//! Round-robin scheduler driven by the PIT tick.
//!
//! Two fixed tables of 8 slots: `running` (started processes, each with a
//! saved kernel context and ring-0 stack pointer) and `pending` (jobs
//! waiting to start). On every tick the handler saves the current
//! process' state, then either starts a pending job (on its own fresh
//! bootstrap stack, never on the interrupt stack) or resumes the next
//! runnable in round-robin order via a coroutine switch.
//!
//! The tick handler acknowledges the PIC itself because a switch means it
//! never returns to the dispatcher on this stack.

use spin::Mutex;

use crate::{
    arch::{self, x86_64::tss, KernelContext},
    drivers::pic,
    error::{KernelError, KernelResult, TtyError},
    irq, mm, process,
    process::{MAX_COMMAND_LEN, MAX_PIDS},
    syscall::exec,
    tty,
};

/// Capacity of each job table (same bound as live processes).
pub const MAX_JOBS: usize = MAX_PIDS;

/// Bootstrap stack bytes per running slot; only `execute` frames live
/// here, the process itself runs on its pid's kernel stack.
const JOB_STACK_SIZE: usize = 4096;

/// A started process and the state needed to resume it.
#[derive(Clone, Copy)]
struct RunningSlot {
    in_use: bool,
    pid: usize,
    context: KernelContext,
    esp0: u32,
    ss0: u16,
}

impl RunningSlot {
    const fn vacant() -> Self {
        Self {
            in_use: false,
            pid: 0,
            context: KernelContext::empty(),
            esp0: 0,
            ss0: 0,
        }
    }
}

/// A job waiting to start.
#[derive(Clone, Copy)]
pub struct PendingJob {
    in_use: bool,
    command: [u8; MAX_COMMAND_LEN],
    command_len: usize,
    tid: i32,
    haltable: bool,
}

impl PendingJob {
    const fn vacant() -> Self {
        Self {
            in_use: false,
            command: [0; MAX_COMMAND_LEN],
            command_len: 0,
            tid: 0,
            haltable: true,
        }
    }

    /// The command bytes of this job.
    pub fn command(&self) -> &[u8] {
        &self.command[..self.command_len]
    }

    /// Terminal the job will be bound to.
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// Whether `halt` may actually end the job's root process.
    pub fn haltable(&self) -> bool {
        self.haltable
    }
}

/// What one tick decided to do.
#[derive(Clone, Copy)]
enum Action {
    /// No live or pending work, or the only runnable is the current one.
    Continue,
    /// Start `job` in running slot `slot`.
    Start { slot: usize, job: PendingJob },
    /// Resume running slot `to`.
    Resume { to: usize },
}

struct Scheduler {
    running: [RunningSlot; MAX_JOBS],
    pending: [PendingJob; MAX_JOBS],
    /// Slot of the process currently on the CPU.
    current: Option<usize>,
    /// Round-robin scan position.
    rr_index: usize,
    running_count: usize,
    pending_count: usize,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            running: [RunningSlot::vacant(); MAX_JOBS],
            pending: [PendingJob::vacant(); MAX_JOBS],
            current: None,
            rr_index: 0,
            running_count: 0,
            pending_count: 0,
        }
    }

    fn free_running_slot(&self) -> Option<usize> {
        self.running.iter().position(|slot| !slot.in_use)
    }

    fn next_pending(&self) -> Option<usize> {
        self.pending.iter().position(|job| job.in_use)
    }

    /// Next in-use running slot after `rr_index`, round robin.
    fn next_running(&self) -> Option<usize> {
        (1..=MAX_JOBS)
            .map(|step| (self.rr_index + step) % MAX_JOBS)
            .find(|&slot| self.running[slot].in_use)
    }

    /// Tick decision: a pending job wins only when `running` has
    /// capacity; otherwise round-robin continues.
    fn plan_tick(&mut self) -> Action {
        if self.running_count == 0 && self.pending_count == 0 {
            return Action::Continue;
        }
        if self.pending_count > 0 && self.running_count < MAX_JOBS {
            if let (Some(slot), Some(pending_index)) = (self.free_running_slot(), self.next_pending())
            {
                let job = self.pending[pending_index];
                self.pending[pending_index].in_use = false;
                self.pending_count -= 1;
                self.running[slot] = RunningSlot {
                    in_use: true,
                    pid: 0,
                    context: KernelContext::empty(),
                    esp0: tss::kernel_stack(),
                    ss0: tss::kernel_stack_segment(),
                };
                self.running_count += 1;
                self.current = Some(slot);
                self.rr_index = slot;
                return Action::Start { slot, job };
            }
        }
        match self.next_running() {
            Some(to) if Some(to) != self.current => {
                self.rr_index = to;
                Action::Resume { to }
            }
            _ => Action::Continue,
        }
    }
}

static SCHED: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Handoff cell from the tick handler to the job trampoline.
static STARTING_JOB: Mutex<Option<PendingJob>> = Mutex::new(None);

/// Context save target for control flows that are never resumed (the
/// boot idle loop, finished job stacks).
static DISCARD_CONTEXT: Mutex<KernelContext> = Mutex::new(KernelContext::empty());

#[repr(C, align(16))]
struct JobStack([u8; JOB_STACK_SIZE]);

static mut JOB_STACKS: [JobStack; MAX_JOBS] = [
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
    JobStack([0; JOB_STACK_SIZE]),
];

fn job_stack_top(slot: usize) -> u32 {
    // SAFETY: address computation only.
    let base = unsafe { core::ptr::addr_of!(JOB_STACKS[slot]) as usize };
    (base + JOB_STACK_SIZE - 4) as u32
}

/// Reset both tables and hook the PIT vector.
pub fn init() {
    arch::without_interrupts(|| {
        *SCHED.lock() = Scheduler::new();
        *STARTING_JOB.lock() = None;
    });
    irq::install_handler(irq::PIT_VECTOR, scheduler_tick);
    log::info!("sched: round-robin over {} slots", MAX_JOBS);
}

/// Enqueue a job for terminal `tid` (`-1` runs it headless).
pub fn schedule_job(command: &[u8], tid: i32, haltable: bool) -> KernelResult<()> {
    if !(process::HEADLESS_TTY..tty::NUM_TERMINALS as i32).contains(&tid) {
        return Err(KernelError::Tty(TtyError::BadTerminal));
    }
    if command.is_empty() || command.len() > MAX_COMMAND_LEN {
        return Err(KernelError::InvalidArgument);
    }
    arch::without_interrupts(|| {
        let mut sched = SCHED.lock();
        let Some(index) = sched.pending.iter().position(|job| !job.in_use) else {
            return Err(KernelError::Tty(TtyError::PendingFull));
        };
        let job = &mut sched.pending[index];
        job.in_use = true;
        job.command[..command.len()].copy_from_slice(command);
        job.command_len = command.len();
        job.tid = tid;
        job.haltable = haltable;
        sched.pending_count += 1;
        Ok(())
    })
}

/// Jobs waiting to start.
pub fn pending_count() -> usize {
    arch::without_interrupts(|| SCHED.lock().pending_count)
}

/// Started jobs.
pub fn running_count() -> usize {
    arch::without_interrupts(|| SCHED.lock().running_count)
}

/// The PIT tick. Runs with interrupts disabled (interrupt gate); when it
/// returns, the IRQ stub's `iret` resumes whichever process is then
/// current.
pub fn scheduler_tick() {
    // Acknowledge first: a switch below means we never return through the
    // dispatcher's EOI path.
    pic::send_eoi(pic::PIT_LINE);

    let current_pid = process::current_pid();
    let (action, prev_slot) = {
        let mut sched = SCHED.lock();
        let prev = sched.current;
        if let (Some(slot), Some(pid)) = (prev, current_pid) {
            sched.running[slot].pid = pid;
            sched.running[slot].esp0 = tss::kernel_stack();
            sched.running[slot].ss0 = tss::kernel_stack_segment();
        }
        (sched.plan_tick(), prev)
    };

    match action {
        Action::Continue => {}
        Action::Start { slot, job } => {
            if let Some(pid) = current_pid {
                let tid = process::with_pcb(pid, |pcb| pcb.tid).unwrap_or(process::HEADLESS_TTY);
                tty::save_console_state(tid);
            }
            *STARTING_JOB.lock() = Some(job);
            let save = save_target_for(prev_slot);
            let load = {
                let mut sched = SCHED.lock();
                sched.running[slot].context =
                    KernelContext::fresh(pending_job_entry, job_stack_top(slot));
                &sched.running[slot].context as *const KernelContext
            };
            // SAFETY: save/load point into static storage; interrupts are
            // off and stay off until the new flow re-enables them.
            unsafe { arch::context_switch(save, load) };
        }
        Action::Resume { to } => {
            if let Some(pid) = current_pid {
                let tid = process::with_pcb(pid, |pcb| pcb.tid).unwrap_or(process::HEADLESS_TTY);
                tty::save_console_state(tid);
            }
            let save = save_target_for(prev_slot);
            let load = prepare_resume(to);
            // SAFETY: as above; `to` was chosen under the lock and its
            // context describes a live suspended kernel stack.
            unsafe { arch::context_switch(save, load) };
        }
    }
}

/// Where to file the suspended flow's context: the slot it was running
/// in, or the discard slot for the boot idle loop.
fn save_target_for(prev_slot: Option<usize>) -> *mut KernelContext {
    let mut sched = SCHED.lock();
    match prev_slot {
        Some(slot) if sched.running[slot].in_use => {
            &mut sched.running[slot].context as *mut KernelContext
        }
        _ => &mut *DISCARD_CONTEXT.lock() as *mut KernelContext,
    }
}

/// Switch the machine's per-process state to slot `to` and return its
/// context pointer.
fn prepare_resume(to: usize) -> *const KernelContext {
    let (pid, esp0, ss0) = {
        let mut sched = SCHED.lock();
        sched.current = Some(to);
        let slot = &sched.running[to];
        (slot.pid, slot.esp0, slot.ss0)
    };
    let tid = process::with_pcb(pid, |pcb| pcb.tid).unwrap_or(process::HEADLESS_TTY);
    mm::switch_to(pid);
    mm::map_user_vidmem(tid, tty::tid_visible(tid));
    tty::load_console_state(tid);
    tss::set_kernel_stack(esp0, ss0);
    process::set_current(Some(pid));
    let sched = SCHED.lock();
    &sched.running[to].context as *const KernelContext
}

/// First frame on a fresh bootstrap stack: run the handed-over job to
/// completion, then retire the slot and hand the CPU onward.
extern "C" fn pending_job_entry() -> ! {
    let job = STARTING_JOB.lock().take();
    if let Some(job) = job {
        let status = exec::execute_helper(job.command(), job.tid(), false, job.haltable());
        match status {
            Ok(status) => log::info!("sched: job exited with status {}", status),
            Err(err) => log::warn!("sched: job failed to start: {}", err),
        }
    }

    // The job tree is gone; free the slot and resume someone else.
    arch::disable_interrupts();
    let next = {
        let mut sched = SCHED.lock();
        if let Some(slot) = sched.current.take() {
            if sched.running[slot].in_use {
                sched.running[slot].in_use = false;
                sched.running_count -= 1;
            }
        }
        sched.next_running()
    };
    process::set_current(None);

    match next {
        Some(to) => {
            let save = &mut *DISCARD_CONTEXT.lock() as *mut KernelContext;
            let load = prepare_resume(to);
            // SAFETY: this stack is dead after the switch; the discard
            // context is never resumed.
            unsafe { arch::context_switch(save, load) };
            unreachable!("dead job stack resumed");
        }
        None => {
            arch::enable_interrupts();
            arch::halt_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain() {
        init();
    }

    #[test]
    fn pending_job_waits_for_capacity() {
        let _guard = crate::test_lock();
        drain();
        let mut sched = Scheduler::new();
        // Fill every running slot.
        for slot in sched.running.iter_mut() {
            slot.in_use = true;
        }
        sched.running_count = MAX_JOBS;
        sched.current = Some(0);
        sched.rr_index = 0;
        sched.pending[0] = PendingJob {
            in_use: true,
            command: [0; MAX_COMMAND_LEN],
            command_len: 0,
            tid: 0,
            haltable: true,
        };
        sched.pending_count = 1;

        // Saturated: round-robin continues, the job stays queued.
        match sched.plan_tick() {
            Action::Resume { to } => assert_eq!(to, 1),
            _ => panic!("expected a round-robin resume"),
        }
        assert_eq!(sched.pending_count, 1);

        // With a slot free, the pending job wins the tick.
        sched.running[3].in_use = false;
        sched.running_count -= 1;
        match sched.plan_tick() {
            Action::Start { slot, .. } => assert_eq!(slot, 3),
            _ => panic!("expected the pending job to start"),
        }
        assert_eq!(sched.pending_count, 0);
        assert_eq!(sched.current, Some(3));
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let mut sched = Scheduler::new();
        for slot in [1, 4, 6] {
            sched.running[slot].in_use = true;
            sched.running_count += 1;
        }
        sched.current = Some(1);
        sched.rr_index = 1;
        let mut order = [0usize; 6];
        for entry in order.iter_mut() {
            match sched.plan_tick() {
                Action::Resume { to } => {
                    *entry = to;
                    sched.current = Some(to);
                }
                _ => panic!("expected a resume"),
            }
        }
        assert_eq!(order, [4, 6, 1, 4, 6, 1]);
    }

    #[test]
    fn lone_task_continues_without_switching() {
        let mut sched = Scheduler::new();
        sched.running[2].in_use = true;
        sched.running_count = 1;
        sched.current = Some(2);
        sched.rr_index = 2;
        assert!(matches!(sched.plan_tick(), Action::Continue));
    }

    #[test]
    fn idle_machine_does_nothing() {
        let mut sched = Scheduler::new();
        assert!(matches!(sched.plan_tick(), Action::Continue));
    }

    #[test]
    fn schedule_job_validates_terminal_and_capacity() {
        let _guard = crate::test_lock();
        drain();
        assert!(schedule_job(b"shell", 5, true).is_err());
        assert!(schedule_job(b"shell", -2, true).is_err());
        assert!(schedule_job(b"", 0, true).is_err());

        for _ in 0..MAX_JOBS {
            schedule_job(b"counter", -1, true).unwrap();
        }
        assert_eq!(
            schedule_job(b"counter", -1, true),
            Err(KernelError::Tty(TtyError::PendingFull)),
        );
        assert_eq!(pending_count(), MAX_JOBS);
        drain();
    }

    #[test]
    fn headless_jobs_are_schedulable() {
        let _guard = crate::test_lock();
        drain();
        assert!(schedule_job(b"daemon", -1, true).is_ok());
        assert_eq!(pending_count(), 1);
        drain();
    }
}
