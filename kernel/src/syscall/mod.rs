//! The system-call surface.
//!
//! User code enters through trap gate 0x80 with the call number in `eax`
//! and arguments in `ebx`/`ecx`/`edx`. The assembly gate pushes those
//! registers and calls [`syscall_dispatch`], which marshals user pointers
//! into slices and routes to the typed handlers. Errors surface as `-1`
//! (or `-2` for pid exhaustion) exactly at this boundary.

pub mod exec;

use crate::{
    error::KernelResult,
    fs::file,
    mm, process, sched,
};

/// System call numbers (1-based).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt = 1,
    Execute = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    GetArgs = 7,
    Vidmap = 8,
    SetHandler = 9,
    SigReturn = 10,
    Run = 11,
}

impl Syscall {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Syscall::Halt),
            2 => Some(Syscall::Execute),
            3 => Some(Syscall::Read),
            4 => Some(Syscall::Write),
            5 => Some(Syscall::Open),
            6 => Some(Syscall::Close),
            7 => Some(Syscall::GetArgs),
            8 => Some(Syscall::Vidmap),
            9 => Some(Syscall::SetHandler),
            10 => Some(Syscall::SigReturn),
            11 => Some(Syscall::Run),
            _ => None,
        }
    }
}

fn status_of<T: Into<isize>>(result: KernelResult<T>) -> isize {
    match result {
        Ok(value) => value.into(),
        Err(err) => err.status(),
    }
}

/// Gate entry point: `nr` from `eax`, arguments from `ebx`, `ecx`, `edx`.
///
/// # Safety contract
/// Pointer arguments come straight from ring 3; each handler validates
/// them (non-null, inside the user window where required) before any
/// dereference.
#[no_mangle]
pub extern "C" fn syscall_dispatch(nr: u32, a: u32, b: u32, c: u32) -> isize {
    let Some(call) = Syscall::from_raw(nr) else {
        return -1;
    };
    match call {
        Syscall::Halt => exec::halt_current(a & 0xFF),
        Syscall::Execute => {
            let mut command = [0u8; process::MAX_COMMAND_LEN];
            let Some(len) = copy_user_cstr(a, &mut command) else {
                return -1;
            };
            exec::execute(&command[..len])
        }
        Syscall::Read => {
            let Some(buf) = user_slice_mut(b, c) else {
                return -1;
            };
            sys_read(a as i32, buf)
        }
        Syscall::Write => {
            let Some(buf) = user_slice(b, c) else {
                return -1;
            };
            sys_write(a as i32, buf)
        }
        Syscall::Open => {
            let mut name = [0u8; process::MAX_COMMAND_LEN];
            let Some(len) = copy_user_cstr(a, &mut name) else {
                return -1;
            };
            sys_open(&name[..len])
        }
        Syscall::Close => sys_close(a as i32),
        Syscall::GetArgs => {
            let Some(buf) = user_slice_mut(a, b) else {
                return -1;
            };
            sys_getargs(buf)
        }
        Syscall::Vidmap => sys_vidmap(a),
        Syscall::SetHandler | Syscall::SigReturn => -1,
        Syscall::Run => {
            let mut command = [0u8; process::MAX_COMMAND_LEN];
            let Some(len) = copy_user_cstr(a, &mut command) else {
                return -1;
            };
            sys_run(&command[..len], b as i32)
        }
    }
}

/// `read(fd, buf, n)`: bytes read, 0 at end-of-file, or -1.
pub fn sys_read(fd: i32, buf: &mut [u8]) -> isize {
    if !(0..process::MAX_OPEN_FILES as i32).contains(&fd) {
        return -1;
    }
    match file::read_fd(fd as usize, buf) {
        Ok(read) => read as isize,
        Err(err) => err.status(),
    }
}

/// `write(fd, buf, n)`: bytes written or -1.
pub fn sys_write(fd: i32, buf: &[u8]) -> isize {
    if !(0..process::MAX_OPEN_FILES as i32).contains(&fd) {
        return -1;
    }
    match file::write_fd(fd as usize, buf) {
        Ok(written) => written as isize,
        Err(err) => err.status(),
    }
}

/// `open(name)`: new fd (≥ 2) or -1.
pub fn sys_open(name: &[u8]) -> isize {
    match file::open_by_name(name) {
        Ok(fd) => fd as isize,
        Err(err) => err.status(),
    }
}

/// `close(fd)`: 0 or -1; the stdio fds may not be closed.
pub fn sys_close(fd: i32) -> isize {
    if !(0..process::MAX_OPEN_FILES as i32).contains(&fd) {
        return -1;
    }
    status_of(file::close_fd(fd as usize).map(|()| 0isize))
}

/// `getargs(buf, n)`: 0 when at least one argument was present, -1
/// otherwise. Copies the argv tail (after the command name and the space
/// that follows it).
pub fn sys_getargs(buf: &mut [u8]) -> isize {
    let copied = process::with_current(|pcb| {
        let command = &pcb.command[..pcb.command_len];
        let space = command.iter().position(|&b| b == b' ')?;
        let args = &command[space + 1..];
        if args.is_empty() {
            return None;
        }
        let n = buf.len().min(args.len());
        buf[..n].copy_from_slice(&args[..n]);
        if n < buf.len() {
            buf[n] = 0;
        }
        Some(())
    });
    match copied {
        Ok(Some(())) => 0,
        _ => -1,
    }
}

/// Validation for `vidmap`'s output pointer: inside the current user
/// window, dword-aligned, with room for the write.
pub fn vidmap_target_ok(addr: u32) -> bool {
    addr >= mm::USER_WINDOW_BASE
        && addr <= mm::USER_WINDOW_BASE + mm::USER_WINDOW_SIZE - 4
        && addr % 4 == 0
}

/// `vidmap(**ptr)`: writes the terminal's user video address through the
/// validated pointer.
pub fn sys_vidmap(addr: u32) -> isize {
    if !vidmap_target_ok(addr) {
        return -1;
    }
    let tid = process::current_tid();
    let video = mm::user_video_addr(tid);
    // SAFETY: the target was just validated to lie inside the mapped user
    // window and to be aligned.
    unsafe { core::ptr::write_volatile(addr as usize as *mut u32, video) };
    0
}

/// `run(command, tid)`: queue a background job; 0 or -1.
pub fn sys_run(command: &[u8], tid: i32) -> isize {
    status_of(sched::schedule_job(command, tid, true).map(|()| 0isize))
}

// ---------------------------------------------------------------------------
// User-pointer marshalling
// ---------------------------------------------------------------------------

fn user_slice(addr: u32, len: u32) -> Option<&'static [u8]> {
    if addr == 0 {
        return None;
    }
    // SAFETY: ring-3 addresses are readable through the flat kernel
    // mapping; length is bounded by the register width.
    Some(unsafe { core::slice::from_raw_parts(addr as usize as *const u8, len as usize) })
}

fn user_slice_mut(addr: u32, len: u32) -> Option<&'static mut [u8]> {
    if addr == 0 {
        return None;
    }
    // SAFETY: as above, and the syscall ABI hands the buffer to the
    // kernel for the duration of the call.
    Some(unsafe { core::slice::from_raw_parts_mut(addr as usize as *mut u8, len as usize) })
}

fn copy_user_cstr(addr: u32, buf: &mut [u8]) -> Option<usize> {
    if addr == 0 {
        return None;
    }
    for (index, slot) in buf.iter_mut().enumerate() {
        // SAFETY: byte-wise read of a NUL-terminated ring-3 string; stops
        // at the buffer bound.
        let byte = unsafe { core::ptr::read((addr as usize + index) as *const u8) };
        if byte == 0 {
            return Some(index);
        }
        *slot = byte;
    }
    Some(buf.len())
}
