//! Error types for the weft runtime

use libc::c_int;
use thiserror::Error;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors surfaced by the runtime core.
///
/// `Interrupted` and `WouldBlock` are internal: the hook layer retries the
/// former and converts the latter into a suspension, so neither reaches a
/// caller. The rest map onto the errno a hooked POSIX caller expects via
/// [`WeftError::errno`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeftError {
    /// Fd policy record says closed, or the fd is not registered
    #[error("bad file descriptor")]
    BadFd,

    /// Reactor registration failed at the kernel level
    #[error("invalid reactor registration")]
    Invalid,

    /// Timer deadline expired before readiness
    #[error("operation timed out")]
    TimedOut,

    /// Syscall returned EINTR
    #[error("interrupted system call")]
    Interrupted,

    /// Syscall returned EAGAIN/EWOULDBLOCK
    #[error("operation would block")]
    WouldBlock,

    /// Post-writable SO_ERROR was non-zero for a hooked connect
    #[error("connect failed: errno {0}")]
    ConnectFailed(i32),

    /// addEvent found the direction bit already set
    #[error("waiter already registered for this fd and direction")]
    AlreadyRegistered,

    /// Submission after stop()
    #[error("scheduler is stopped")]
    SchedulerStopped,

    /// Raw kernel failure not covered by a more specific kind
    #[error("os error: errno {0}")]
    Os(i32),
}

impl WeftError {
    /// The errno a hooked POSIX caller should observe for this error.
    pub fn errno(&self) -> c_int {
        match self {
            WeftError::BadFd => libc::EBADF,
            WeftError::Invalid => libc::EINVAL,
            WeftError::TimedOut => libc::ETIMEDOUT,
            WeftError::Interrupted => libc::EINTR,
            WeftError::WouldBlock => libc::EAGAIN,
            WeftError::ConnectFailed(e) => *e,
            WeftError::AlreadyRegistered => libc::EEXIST,
            WeftError::SchedulerStopped => libc::ESHUTDOWN,
            WeftError::Os(e) => *e,
        }
    }

    /// Wrap the calling thread's current errno
    pub fn last_os_error() -> Self {
        WeftError::Os(unsafe { *libc::__errno_location() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(WeftError::BadFd.errno(), libc::EBADF);
        assert_eq!(WeftError::Invalid.errno(), libc::EINVAL);
        assert_eq!(WeftError::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(WeftError::ConnectFailed(libc::ECONNREFUSED).errno(), libc::ECONNREFUSED);
    }

    #[test]
    fn test_display() {
        assert_eq!(WeftError::TimedOut.to_string(), "operation timed out");
        assert_eq!(WeftError::Os(7).to_string(), "os error: errno 7");
    }
}
