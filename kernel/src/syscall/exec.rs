//! `execute` and `halt`: process creation, the binary loader, and the
//! return path to the parent.
//!
//! `execute` parses and filters the command line, validates the binary,
//! claims a pid and its 4 MiB frame, copies the image into the user
//! window, builds the PCB, and IRETs to ring 3. The child's eventual
//! `halt` unwinds everything and resumes the parent's saved `execute`
//! frame with the child's exit status. Non-haltable processes (root
//! shells) are re-executed in place instead of being torn down.

use crate::{
    arch::{self, x86_64::tss, x86_64::KERNEL_DS, KernelContext},
    error::{KernelError, KernelResult, ProcError},
    fs::{file, image, FileType},
    mm, process, tty,
};

/// Executable identification bytes.
const MAGIC: [u8; 4] = [0x7F, 0x45, 0x4C, 0x46];
/// Byte offset of the little-endian entry address in the image.
const ENTRY_OFFSET: usize = 24;

/// Collapse runs of blanks: trims the ends and rejoins the tokens with
/// single spaces. Fails when nothing is left.
pub fn filter_command(raw: &[u8], out: &mut [u8; process::MAX_COMMAND_LEN]) -> KernelResult<usize> {
    let mut len = 0;
    let mut in_token = false;
    for &byte in raw {
        if byte == b' ' || byte == b'\t' || byte == b'\n' {
            in_token = false;
            continue;
        }
        if !in_token && len > 0 {
            if len >= out.len() {
                return Err(KernelError::Proc(ProcError::BadCommand));
            }
            out[len] = b' ';
            len += 1;
        }
        if len >= out.len() {
            return Err(KernelError::Proc(ProcError::BadCommand));
        }
        out[len] = byte;
        len += 1;
        in_token = true;
    }
    if len == 0 {
        return Err(KernelError::Proc(ProcError::BadCommand));
    }
    Ok(len)
}

/// The command name: everything before the first space.
pub fn first_token(command: &[u8]) -> &[u8] {
    match command.iter().position(|&b| b == b' ') {
        Some(space) => &command[..space],
        None => command,
    }
}

/// A loaded, ready-to-enter program.
#[derive(Debug)]
pub struct LoadedProgram {
    pub pid: usize,
    pub entry: u32,
    pub tid: i32,
}

/// Everything `execute` does short of the ring transition: validate the
/// binary, claim a pid, map its frame, copy the image, build the PCB.
pub fn load_program(
    command: &[u8],
    tid_request: i32,
    has_parent: bool,
    haltable: bool,
) -> KernelResult<LoadedProgram> {
    let mut filtered = [0u8; process::MAX_COMMAND_LEN];
    let filtered_len = filter_command(command, &mut filtered)?;
    let name = first_token(&filtered[..filtered_len]);

    let fs = image::mounted()?;
    let dentry = fs.dentry_by_name(name)?;
    if dentry.file_type != FileType::Regular {
        return Err(KernelError::Proc(ProcError::NotExecutable));
    }
    let length = fs.inode_length(dentry.inode)?;
    if length <= MAGIC.len() as u32 || length >= mm::USER_WINDOW_SIZE - mm::USER_ENTRY_OFFSET {
        return Err(KernelError::Proc(ProcError::NotExecutable));
    }
    let mut magic = [0u8; 4];
    if fs.read_data(dentry.inode, 0, &mut magic)? != MAGIC.len() || magic != MAGIC {
        return Err(KernelError::Proc(ProcError::NotExecutable));
    }

    // The foreground-shell flag gates history recording.
    tty::set_in_shell(name.starts_with(b"shell"));

    // Resolve the terminal binding before committing to a pid.
    let tid = match tid_request {
        t if (0..tty::NUM_TERMINALS as i32).contains(&t) => t,
        process::INHERIT_TTY => process::with_current(|pcb| pcb.tid).unwrap_or(0),
        process::HEADLESS_TTY => process::HEADLESS_TTY,
        _ => return Err(KernelError::InvalidArgument),
    };

    let pid = process::allocate_pid()?;

    // Point the user window at the new pid's frame and copy the image in.
    mm::switch_to(pid);
    let window = mm::user_window();
    let image_dst =
        &mut window[mm::USER_ENTRY_OFFSET as usize..(mm::USER_ENTRY_OFFSET + length) as usize];
    if fs.read_data(dentry.inode, 0, image_dst).is_err() {
        process::release_pid(pid);
        return Err(KernelError::Proc(ProcError::NotExecutable));
    }
    let entry = u32::from_le_bytes([
        image_dst[ENTRY_OFFSET],
        image_dst[ENTRY_OFFSET + 1],
        image_dst[ENTRY_OFFSET + 2],
        image_dst[ENTRY_OFFSET + 3],
    ]);

    // Explicit or headless bindings also route console output there.
    if tid_request != process::INHERIT_TTY {
        tty::load_console_state(tid);
    }

    let parent = if has_parent {
        process::current_pid().unwrap_or(pid)
    } else {
        pid
    };

    process::with_slot(pid, |pcb| {
        pcb.in_use = true;
        pcb.pid = pid;
        pcb.parent = parent;
        pcb.parent_context = KernelContext::empty();
        pcb.command = [0; process::MAX_COMMAND_LEN];
        pcb.command[..filtered_len].copy_from_slice(&filtered[..filtered_len]);
        pcb.command_len = filtered_len;
        file::release_all(pcb);
        file::install_stdio(pcb);
        pcb.rtc_rate = process::DEFAULT_RTC_RATE;
        pcb.crashed = false;
        pcb.tid = tid;
        pcb.haltable = haltable;
        pcb.child_status = 0;
    })?;

    tss::set_kernel_stack(process::kernel_stack_top(pid), KERNEL_DS);
    process::set_current(Some(pid));

    Ok(LoadedProgram { pid, entry, tid })
}

/// Full `execute`: load, then IRET into the program; returns the child's
/// exit status when it halts.
pub fn execute_helper(
    command: &[u8],
    tid_request: i32,
    has_parent: bool,
    haltable: bool,
) -> KernelResult<u32> {
    arch::disable_interrupts();
    let loaded = load_program(command, tid_request, has_parent, haltable)?;
    let resume = process::with_pcb(loaded.pid, |pcb| {
        core::ptr::addr_of_mut!(pcb.parent_context)
    })?;

    // SAFETY: the PCB arena is static, so the resume-context pointer
    // stays valid; the child's frame, stack, and esp0 are in place.
    let status = unsafe { arch::enter_user(loaded.entry, mm::USER_STACK_TOP, resume) };

    // Control is back in the parent; refresh the foreground-shell flag.
    let in_shell = process::with_current(|pcb| {
        first_token(&pcb.command[..pcb.command_len]).starts_with(b"shell")
    })
    .unwrap_or(false);
    tty::set_in_shell(in_shell);
    Ok(status)
}

/// `execute` as the system call sees it: inherit the caller's terminal.
pub fn execute(command: &[u8]) -> isize {
    match execute_helper(command, process::INHERIT_TTY, true, true) {
        Ok(status) => status as isize,
        Err(err) => err.status(),
    }
}

struct DyingProcess {
    pid: usize,
    parent: usize,
    tid: i32,
    haltable: bool,
    crashed: bool,
    command: [u8; process::MAX_COMMAND_LEN],
    command_len: usize,
    parent_context: KernelContext,
}

/// End the current process and resume its parent's `execute` frame.
///
/// A crashed process reports [`process::CRASH_STATUS`] regardless of
/// `status`. A non-haltable process is re-executed with the same command
/// and terminal binding instead of dying.
pub fn halt_current(status: u32) -> ! {
    arch::disable_interrupts();

    let Ok(dying) = process::with_current(|pcb| DyingProcess {
        pid: pcb.pid,
        parent: pcb.parent,
        tid: pcb.tid,
        haltable: pcb.haltable,
        crashed: pcb.crashed,
        command: pcb.command,
        command_len: pcb.command_len,
        parent_context: pcb.parent_context,
    }) else {
        // Halt without a process is unrecoverable.
        arch::halt_loop();
    };

    let final_status = if dying.crashed {
        process::CRASH_STATUS
    } else {
        status
    };

    // Report to the parent, then dismantle: fds, pid, paging, esp0.
    let _ = process::with_pcb(dying.parent, |pcb| pcb.child_status = final_status);
    let _ = process::with_current(file::release_all);
    process::release_pid(dying.pid);
    mm::switch_to(dying.parent);
    tss::set_kernel_stack(process::kernel_stack_top(dying.parent), KERNEL_DS);
    let parent_live = process::with_pcb(dying.parent, |_| ()).is_ok();
    process::set_current(if parent_live { Some(dying.parent) } else { None });

    if !dying.haltable {
        // Root shells respawn in place; the fresh incarnation IRETs away
        // and only its own halt comes back through here.
        let _ = execute_helper(
            &dying.command[..dying.command_len],
            dying.tid,
            dying.pid != dying.parent,
            dying.haltable,
        );
    }

    // SAFETY: the parent's context was saved by the matching enter_user;
    // paging and esp0 are already the parent's again.
    unsafe { arch::resume_parent(&dying.parent_context, final_status) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testfs::ImageBuilder;

    fn mount_sample() {
        let image = ImageBuilder::new()
            .rtc("rtc")
            .executable("shell", 0x0804_8054, 5000)
            .executable("counter", 0x0804_8100, 9000)
            .file("notelf", b"#!/bin/sh echo hi")
            .build_static();
        image::init(image).unwrap();
    }

    #[test]
    fn filter_collapses_blank_runs() {
        let mut out = [0u8; process::MAX_COMMAND_LEN];
        let len = filter_command(b"   cat   frame0.txt    now ", &mut out).unwrap();
        assert_eq!(&out[..len], b"cat frame0.txt now");
    }

    #[test]
    fn filter_rejects_blank_commands() {
        let mut out = [0u8; process::MAX_COMMAND_LEN];
        assert!(filter_command(b"", &mut out).is_err());
        assert!(filter_command(b"    ", &mut out).is_err());
    }

    #[test]
    fn first_token_stops_at_the_space() {
        assert_eq!(first_token(b"cat a b"), b"cat");
        assert_eq!(first_token(b"ls"), b"ls");
    }

    #[test]
    fn loader_accepts_a_wellformed_binary() {
        let _guard = crate::test_lock();
        process::init();
        tty::init();
        mount_sample();

        let loaded = load_program(b"  shell  ", 0, false, false).unwrap();
        assert_eq!(loaded.pid, 0);
        assert_eq!(loaded.entry, 0x0804_8054);
        assert_eq!(loaded.tid, 0);
        assert_eq!(mm::paging::current_user_frame(), Some(mm::user_frame_for(0)));
        process::with_pcb(loaded.pid, |pcb| {
            assert_eq!(&pcb.command[..pcb.command_len], b"shell");
            assert!(pcb.files[0].present);
            assert!(pcb.files[1].present);
            assert!(!pcb.haltable);
            assert_eq!(pcb.parent, loaded.pid);
        })
        .unwrap();
        assert_eq!(tss::kernel_stack(), process::kernel_stack_top(0));

        process::set_current(None);
        process::init();
    }

    #[test]
    fn loader_copies_the_image_into_the_window() {
        let _guard = crate::test_lock();
        process::init();
        tty::init();
        mount_sample();

        let loaded = load_program(b"counter", -1, false, true).unwrap();
        assert_eq!(loaded.tid, process::HEADLESS_TTY);
        let window = mm::user_window();
        let base = mm::USER_ENTRY_OFFSET as usize;
        assert_eq!(&window[base..base + 4], &MAGIC[..]);

        process::set_current(None);
        process::init();
    }

    #[test]
    fn loader_rejects_non_executables() {
        let _guard = crate::test_lock();
        process::init();
        tty::init();
        mount_sample();

        assert!(load_program(b"notelf", 0, true, true).is_err());
        assert!(load_program(b"missing", 0, true, true).is_err());
        assert!(load_program(b"rtc", 0, true, true).is_err());
        // Nothing was claimed by the failed loads.
        assert_eq!(process::free_pid_count(), process::MAX_PIDS);
    }

    #[test]
    fn pid_exhaustion_reports_try_later() {
        let _guard = crate::test_lock();
        process::init();
        tty::init();
        mount_sample();

        for _ in 0..process::MAX_PIDS {
            load_program(b"counter", -1, false, true).unwrap();
        }
        let err = load_program(b"counter", -1, false, true).unwrap_err();
        assert_eq!(err.status(), -2);

        process::set_current(None);
        process::init();
    }

    #[test]
    fn argv_round_trip_through_getargs() {
        let _guard = crate::test_lock();
        process::init();
        tty::init();
        mount_sample();

        let loaded = load_program(b"  counter   12   34  ", -1, false, true).unwrap();
        process::set_current(Some(loaded.pid));
        let mut buf = [0u8; 16];
        assert_eq!(crate::syscall::sys_getargs(&mut buf), 0);
        assert_eq!(&buf[..6], b"12 34\0");

        process::set_current(None);
        process::init();
    }
}
