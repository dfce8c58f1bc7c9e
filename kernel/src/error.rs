use core::fmt::Display;

/// Kernel error codes, POSIX errno values.
///
/// Syscalls encode failures as `-(errno)` in the return register (`a0`);
/// user space treats values in `[-4096, -1]` as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KernelError {
    /// EPERM
    NotPermitted = 1,
    /// ENOENT
    NoEntry = 2,
    /// ESRCH
    NoProcess = 3,
    /// E2BIG
    ArgumentListTooLong = 7,
    /// ENOEXEC
    ExecFormat = 8,
    /// EBADF
    BadDescriptor = 9,
    /// ECHILD
    NoChildren = 10,
    /// ENOMEM
    OutOfMemory = 12,
    /// EACCES
    AccessDenied = 13,
    /// EFAULT
    BadAddress = 14,
    /// ENOTBLK
    NotABlockDevice = 15,
    /// ENODEV
    NoDevice = 19,
    /// ENOTDIR
    NotADirectory = 20,
    /// EISDIR
    IsADirectory = 21,
    /// EINVAL
    InvalidArgument = 22,
    /// EMFILE
    TooManyFiles = 24,
    /// ENOTTY
    NotATty = 25,
    /// ESPIPE
    IllegalSeek = 29,
    /// ENOTEMPTY
    NotEmpty = 39,
    /// EOTHER: everything without a better match (out of blocks, out of
    /// inodes, busy mounts, I/O trouble)
    Other = 95,
}

impl KernelError {
    pub fn as_errno(self) -> u16 {
        self as u16
    }
}

impl From<core::alloc::AllocError> for KernelError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::OutOfMemory
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::NotPermitted => write!(f, "operation not permitted"),
            KernelError::NoEntry => write!(f, "no such file or directory"),
            KernelError::NoProcess => write!(f, "no such process"),
            KernelError::ArgumentListTooLong => write!(f, "argument list too long"),
            KernelError::ExecFormat => write!(f, "exec format error"),
            KernelError::BadDescriptor => write!(f, "bad file descriptor"),
            KernelError::NoChildren => write!(f, "no child processes"),
            KernelError::OutOfMemory => write!(f, "cannot allocate memory"),
            KernelError::AccessDenied => write!(f, "permission denied"),
            KernelError::BadAddress => write!(f, "bad address"),
            KernelError::NotABlockDevice => write!(f, "block device required"),
            KernelError::NoDevice => write!(f, "no such device"),
            KernelError::NotADirectory => write!(f, "not a directory"),
            KernelError::IsADirectory => write!(f, "is a directory"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::TooManyFiles => write!(f, "too many open files"),
            KernelError::NotATty => write!(f, "inappropriate ioctl for device"),
            KernelError::IllegalSeek => write!(f, "illegal seek"),
            KernelError::NotEmpty => write!(f, "directory not empty"),
            KernelError::Other => write!(f, "error"),
        }
    }
}

/// Return an error, logging file:line in debug builds.
/// Use instead of `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        #[cfg(debug_assertions)]
        $crate::println!("! error at {}:{}: {}", file!(), line!(), $e);
        return Err($e.into());
    }};
}

/// Log the error site of a failed result.
#[macro_export]
macro_rules! log {
    ($e:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                Err(e)
            }
        }
    };
}

/// Propagate an error with location logging. Use instead of `?`.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}
