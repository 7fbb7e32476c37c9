//! Kernel error types.
//!
//! Every fallible kernel path returns one of these instead of a bare status
//! integer; the syscall layer converts them to negative errno values at the
//! ring boundary.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    /// A user-supplied address failed validation
    BadUserAddress {
        addr: usize,
    },

    /// Process-related errors
    ProcessNotFound {
        pid: u32,
    },
    NoChildren,
    ProcessTableFull,

    /// Scheduler-related errors
    SchedulerError(SchedError),

    /// System call errors
    SyscallError(SyscallError),

    /// Filesystem-related errors
    FsError(FsError),

    /// Signal errors
    InvalidSignal {
        signum: usize,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    /// Operation would block
    WouldBlock,
    /// Pipe peer closed: write with no readers
    BrokenPipe,
    /// Blocking operation cancelled by a fatal signal
    Interrupted,
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    TaskNotFound { pid: u32 },
    QueueEmpty,
    AlreadyQueued,
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall { nr: usize },
    InvalidArgument { arg: usize },
    InvalidPointer { addr: usize },
    BufferTooSmall { required: usize, provided: usize },
    StringTooLong { max: usize },
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Path already exists
    AlreadyExists,
    /// Permission denied
    PermissionDenied,
    /// Target is not a directory
    NotADirectory,
    /// Target is not a file
    NotAFile,
    /// Target is a directory (when file expected)
    IsADirectory,
    /// Filesystem is read-only
    ReadOnly,
    /// Invalid path format
    InvalidPath,
    /// Root filesystem not mounted
    NoRootFs,
    /// Path already has a mount point
    AlreadyMounted,
    /// I/O error during operation
    IoError,
    /// On-disk structure failed validation
    Corrupted,
    /// Directory is not empty
    DirectoryNotEmpty,
    /// File descriptor table is full
    TooManyOpenFiles,
    /// Invalid file descriptor
    BadFileDescriptor,
    /// Operation not supported on this node type
    NotSupported,
    /// File size exceeds maximum supported limit
    FileTooLarge,
    /// No free blocks or inodes left on the volume
    NoSpace,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::BadUserAddress { addr } => write!(f, "Bad user address: {:#010x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "Process {} not found", pid),
            Self::NoChildren => write!(f, "No children to wait for"),
            Self::ProcessTableFull => write!(f, "Process table full"),
            Self::SchedulerError(e) => write!(f, "Scheduler error: {:?}", e),
            Self::SyscallError(e) => write!(f, "Syscall error: {:?}", e),
            Self::FsError(e) => write!(f, "Filesystem error: {:?}", e),
            Self::InvalidSignal { signum } => write!(f, "Invalid signal number {}", signum),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied for operation: {}", operation)
            }
            Self::WouldBlock => write!(f, "Operation would block"),
            Self::BrokenPipe => write!(f, "Broken pipe"),
            Self::Interrupted => write!(f, "Interrupted by signal"),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::SyscallError(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

/// Errno values returned to user space as negative syscall results.
///
/// The numbering follows the classic Unix assignments so user-space C code
/// can reuse familiar constants.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Eperm = 1,
    Enoent = 2,
    Esrch = 3,
    Eintr = 4,
    Eio = 5,
    Ebadf = 9,
    Echild = 10,
    Eagain = 11,
    Enomem = 12,
    Eacces = 13,
    Efault = 14,
    Eexist = 17,
    Enotdir = 20,
    Eisdir = 21,
    Einval = 22,
    Emfile = 24,
    Efbig = 27,
    Enospc = 28,
    Epipe = 32,
    Enosys = 38,
    Enotempty = 39,
}

impl Errno {
    /// The value placed in the saved EAX of a failing syscall.
    pub fn as_return_value(self) -> i32 {
        -(self as i32)
    }
}

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => Errno::Enoent,
            FsError::AlreadyExists | FsError::AlreadyMounted => Errno::Eexist,
            FsError::PermissionDenied | FsError::ReadOnly => Errno::Eacces,
            FsError::NotADirectory => Errno::Enotdir,
            FsError::IsADirectory => Errno::Eisdir,
            FsError::NotAFile => Errno::Einval,
            FsError::InvalidPath => Errno::Einval,
            FsError::NoRootFs => Errno::Eio,
            FsError::IoError | FsError::Corrupted => Errno::Eio,
            FsError::DirectoryNotEmpty => Errno::Enotempty,
            FsError::TooManyOpenFiles => Errno::Emfile,
            FsError::BadFileDescriptor => Errno::Ebadf,
            FsError::NotSupported => Errno::Enosys,
            FsError::FileTooLarge => Errno::Efbig,
            FsError::NoSpace => Errno::Enospc,
        }
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } => Errno::Enomem,
            KernelError::BadUserAddress { .. } => Errno::Efault,
            KernelError::ProcessNotFound { .. } => Errno::Esrch,
            KernelError::NoChildren => Errno::Echild,
            KernelError::ProcessTableFull => Errno::Eagain,
            KernelError::SchedulerError(_) => Errno::Esrch,
            KernelError::SyscallError(e) => match e {
                SyscallError::InvalidSyscall { .. } => Errno::Enosys,
                SyscallError::InvalidPointer { .. } => Errno::Efault,
                _ => Errno::Einval,
            },
            KernelError::FsError(e) => e.into(),
            KernelError::InvalidSignal { .. } => Errno::Einval,
            KernelError::InvalidArgument { .. } => Errno::Einval,
            KernelError::ResourceExhausted { .. } => Errno::Enomem,
            KernelError::PermissionDenied { .. } => Errno::Eperm,
            KernelError::WouldBlock => Errno::Eagain,
            KernelError::BrokenPipe => Errno::Epipe,
            KernelError::Interrupted => Errno::Eintr,
            KernelError::NotInitialized { .. } => Errno::Eio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative_at_the_boundary() {
        assert_eq!(Errno::Enoent.as_return_value(), -2);
        assert_eq!(Errno::Efault.as_return_value(), -14);
    }

    #[test]
    fn fs_errors_map_to_classic_errno() {
        assert_eq!(Errno::from(FsError::NotFound), Errno::Enoent);
        assert_eq!(Errno::from(FsError::BadFileDescriptor), Errno::Ebadf);
        assert_eq!(Errno::from(FsError::DirectoryNotEmpty), Errno::Enotempty);
    }

    #[test]
    fn kernel_error_display_is_one_line() {
        extern crate std;
        use std::string::ToString;
        let msg = KernelError::BadUserAddress { addr: 0x1000 }.to_string();
        assert!(msg.contains("0x00001000"));
        assert!(!msg.contains('\n'));
    }
}
