//! The polymorphic file layer.
//!
//! Every open file is tagged with its backend kind; read/write dispatch on
//! the tag and the kernel never downcasts. Regular files and the directory
//! walk the read-only image, the RTC backend blocks at the process'
//! virtual rate, the terminal backends feed the bound tty, and the sound
//! backend drives the Sound Blaster DMA pipeline.

use crate::{
    drivers::{rtc, sb16},
    error::{FsError, KernelError, KernelResult, ProcError},
    fs::image::{self, FileType, MAX_DENTRIES},
    process, tty,
};

/// Backend carried by an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    RtcVirt,
    TerminalIn,
    TerminalOut,
    SoundOut,
}

/// One slot of a PCB's open-file table.
#[derive(Debug, Clone, Copy)]
pub struct File {
    pub kind: FileKind,
    /// Backing inode; meaningful for regular files only.
    pub inode: u32,
    /// Byte position (regular files) or dentry index (directory).
    pub position: u32,
    pub present: bool,
}

impl File {
    /// An empty, closed slot.
    pub const fn closed() -> Self {
        Self {
            kind: FileKind::RegularFile,
            inode: 0,
            position: 0,
            present: false,
        }
    }

    /// An open file of `kind` backed by `inode`.
    pub const fn open(kind: FileKind, inode: u32) -> Self {
        Self {
            kind,
            inode,
            position: 0,
            present: true,
        }
    }
}

/// The file name that selects the sound backend.
const SOUND_DEVICE_NAME: &[u8] = b"sb16";

/// First fd eligible for `open` (0 and 1 are the terminal).
pub const FIRST_DYNAMIC_FD: usize = 2;

fn first_free_fd(pcb: &process::Pcb) -> KernelResult<usize> {
    pcb.files
        .iter()
        .position(|file| !file.present)
        .ok_or(KernelError::Proc(ProcError::NoFreeFd))
}

/// Resolve `name` and install an open file in the current PCB.
/// Returns the new fd (≥ 2 in practice, since stdio is always present).
pub fn open_by_name(name: &[u8]) -> KernelResult<usize> {
    let fs = image::mounted()?;
    let dentry = fs.dentry_by_name(name)?;
    let file = match dentry.file_type {
        FileType::Rtc => File::open(FileKind::RtcVirt, dentry.inode),
        FileType::Directory => File::open(FileKind::Directory, dentry.inode),
        FileType::Regular if name == SOUND_DEVICE_NAME => {
            File::open(FileKind::SoundOut, dentry.inode)
        }
        FileType::Regular => File::open(FileKind::RegularFile, dentry.inode),
    };
    process::with_current(|pcb| {
        let fd = first_free_fd(pcb)?;
        pcb.files[fd] = file;
        Ok(fd)
    })?
}

/// Close `fd` in the current PCB. The terminal fds are pinned.
pub fn close_fd(fd: usize) -> KernelResult<()> {
    if fd < FIRST_DYNAMIC_FD {
        return Err(KernelError::Proc(ProcError::StdioNotClosable));
    }
    process::with_current(|pcb| {
        let file = pcb
            .files
            .get_mut(fd)
            .ok_or(KernelError::Proc(ProcError::BadFd))?;
        if !file.present {
            return Err(KernelError::Proc(ProcError::BadFd));
        }
        if file.kind == FileKind::SoundOut {
            sb16::stop_playback();
        }
        *file = File::closed();
        Ok(())
    })?
}

fn lookup_fd(fd: usize) -> KernelResult<File> {
    process::with_current(|pcb| {
        pcb.files
            .get(fd)
            .copied()
            .filter(|file| file.present)
            .ok_or(KernelError::Proc(ProcError::BadFd))
    })?
}

fn advance_fd(fd: usize, amount: u32) {
    let _ = process::with_current(|pcb| {
        if let Some(file) = pcb.files.get_mut(fd) {
            file.position += amount;
        }
    });
}

/// Read through `fd`'s backend. Blocking backends (terminal, RTC, sound)
/// suspend the caller until their wakeup condition holds.
pub fn read_fd(fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let file = lookup_fd(fd)?;
    match file.kind {
        FileKind::RegularFile => {
            let fs = image::mounted()?;
            let read = fs.read_data(file.inode, file.position, buf)?;
            advance_fd(fd, read as u32);
            Ok(read)
        }
        FileKind::Directory => read_directory(fd, file.position, buf),
        FileKind::RtcVirt => {
            rtc::virtual_read()?;
            Ok(0)
        }
        FileKind::TerminalIn => tty::terminal_read(buf),
        FileKind::SoundOut => {
            sb16::wait_half_buffer();
            Ok(0)
        }
        FileKind::TerminalOut => Err(KernelError::NotSupported),
    }
}

/// One directory entry name per call, skipping holes; 0 bytes at the end.
/// A too-small buffer skips the entry and fails, like the C walker did.
fn read_directory(fd: usize, start: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let fs = image::mounted()?;
    let mut index = start;
    while index < MAX_DENTRIES as u32 {
        let Ok(dentry) = fs.dentry_by_index(index) else {
            index += 1;
            continue;
        };
        let name = dentry.name();
        set_position(fd, index + 1);
        if buf.len() < name.len() {
            return Err(KernelError::Fs(FsError::BufferTooSmall));
        }
        buf[..name.len()].copy_from_slice(name);
        return Ok(name.len());
    }
    set_position(fd, index);
    Ok(0)
}

fn set_position(fd: usize, position: u32) {
    let _ = process::with_current(|pcb| {
        if let Some(file) = pcb.files.get_mut(fd) {
            file.position = position;
        }
    });
}

/// Write through `fd`'s backend.
pub fn write_fd(fd: usize, buf: &[u8]) -> KernelResult<usize> {
    let file = lookup_fd(fd)?;
    match file.kind {
        FileKind::TerminalOut => tty::terminal_write(buf),
        FileKind::RtcVirt => {
            if buf.len() < 4 {
                return Err(KernelError::InvalidArgument);
            }
            let rate = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            rtc::set_virtual_rate(rate)?;
            Ok(0)
        }
        FileKind::SoundOut => {
            sb16::start_playback(buf)?;
            Ok(0)
        }
        FileKind::RegularFile | FileKind::Directory | FileKind::TerminalIn => {
            Err(KernelError::NotSupported)
        }
    }
}

/// Install the terminal pair in fds 0 and 1 of a fresh PCB.
pub fn install_stdio(pcb: &mut process::Pcb) {
    pcb.files[0] = File::open(FileKind::TerminalIn, 0);
    pcb.files[1] = File::open(FileKind::TerminalOut, 0);
}

/// Release every fd of a dying process.
pub fn release_all(pcb: &mut process::Pcb) {
    for file in pcb.files.iter_mut() {
        *file = File::closed();
    }
}
