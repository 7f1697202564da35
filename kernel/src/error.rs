//! Kernel-wide error types.
//!
//! Internal code reports failures through these enums; the C-style status
//! integers of the system-call ABI (`-1`, `-2`, …) exist only at the
//! system-call boundary, where [`KernelError::status`] performs the mapping.

use core::fmt;

/// Top-level kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// File-system related errors
    Fs(FsError),
    /// Process / PCB related errors
    Proc(ProcError),
    /// Terminal multiplexer errors
    Tty(TtyError),
    /// A user-supplied pointer, length, or value was unusable
    InvalidArgument,
    /// The requested operation is not supported by this backend
    NotSupported,
}

/// Convenience alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors surfaced by the read-only file-system walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No directory entry carries the requested name
    NotFound,
    /// The name was empty or longer than a dentry can hold
    BadName,
    /// Directory-entry index out of range
    BadIndex,
    /// Inode index ≥ the boot block's inode count
    BadInode,
    /// A data-block index inside the file bounds exceeds the block count
    BadDataBlock,
    /// Read offset lies beyond the file length
    OffsetBeyondEof,
    /// The dentry exists but has the wrong file type for the operation
    WrongType,
    /// The caller's buffer cannot hold the next directory-entry name
    BufferTooSmall,
}

/// Errors surfaced by the process layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// The free-pid heap is empty (8 live processes)
    NoFreePid,
    /// All 8 file-descriptor slots are occupied
    NoFreeFd,
    /// fd outside `0..8`, or the slot is not present
    BadFd,
    /// fd 0 / fd 1 may not be closed
    StdioNotClosable,
    /// The named file is not a well-formed executable
    NotExecutable,
    /// Command string empty or unparsable
    BadCommand,
    /// No such live process
    NoSuchProcess,
}

/// Errors surfaced by the terminal multiplexer and scheduler queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyError {
    /// Terminal id outside the configured range
    BadTerminal,
    /// The pending-job table is full
    PendingFull,
}

impl KernelError {
    /// Map to the status integer the system-call ABI reports to user code.
    ///
    /// Pid exhaustion is the single `-2` ("try later") case; everything else
    /// is `-1`.
    pub fn status(self) -> isize {
        match self {
            KernelError::Proc(ProcError::NoFreePid) => -2,
            _ => -1,
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}

impl From<ProcError> for KernelError {
    fn from(err: ProcError) -> Self {
        KernelError::Proc(err)
    }
}

impl From<TtyError> for KernelError {
    fn from(err: TtyError) -> Self {
        KernelError::Tty(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Fs(e) => write!(f, "fs: {:?}", e),
            KernelError::Proc(e) => write!(f, "process: {:?}", e),
            KernelError::Tty(e) => write!(f, "tty: {:?}", e),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NotSupported => write!(f, "operation not supported"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_exhaustion_is_minus_two() {
        assert_eq!(KernelError::Proc(ProcError::NoFreePid).status(), -2);
    }

    #[test]
    fn everything_else_is_minus_one() {
        assert_eq!(KernelError::Fs(FsError::NotFound).status(), -1);
        assert_eq!(KernelError::InvalidArgument.status(), -1);
        assert_eq!(KernelError::Tty(TtyError::BadTerminal).status(), -1);
    }
}
