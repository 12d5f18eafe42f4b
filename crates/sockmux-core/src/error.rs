//! Portable error kinds for the I/O engine.
//!
//! Native errno values are folded into a closed set of kinds by the pure
//! function [`MuxError::from_errno`]. There is no global error-category
//! registry; anything without a dedicated kind travels as `Unexpected(errno)`
//! and still carries the raw value for diagnostics.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxError {
    /// Operation drained on close or fatal descriptor failure.
    Canceled,
    /// Operation issued on a closed or never-opened handle.
    BadDescriptor,
    /// Malformed call (null buffer, bad address family, ...).
    InvalidArgument,
    /// Native call not ready yet; readiness-model internal retry state.
    WouldBlock,
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    AddrInUse,
    Interrupted,
    /// Any other native error, carrying the raw errno.
    Unexpected(i32),
}

impl MuxError {
    /// Map a native errno to a portable kind. Pure, total.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED => Self::Canceled,
            libc::EBADF | libc::ENOTSOCK => Self::BadDescriptor,
            libc::EINVAL | libc::EFAULT | libc::EAFNOSUPPORT => Self::InvalidArgument,
            libc::EAGAIN | libc::EINPROGRESS => Self::WouldBlock,
            libc::ECONNREFUSED => Self::ConnectionRefused,
            libc::ECONNRESET | libc::EPIPE => Self::ConnectionReset,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::EADDRINUSE => Self::AddrInUse,
            libc::EINTR => Self::Interrupted,
            e => Self::Unexpected(e),
        }
    }

    /// Read the thread-local errno and map it.
    pub fn last_os_error() -> Self {
        Self::from_errno(unsafe { *libc::__errno_location() })
    }

    /// True for the readiness-model "try again on next notification" state.
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "operation canceled"),
            Self::BadDescriptor => write!(f, "bad descriptor"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::ConnectionReset => write!(f, "connection reset"),
            Self::TimedOut => write!(f, "timed out"),
            Self::AddrInUse => write!(f, "address in use"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Unexpected(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for MuxError {}

pub type MuxResult<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MuxError::from_errno(libc::ECANCELED), MuxError::Canceled);
        assert_eq!(MuxError::from_errno(libc::EBADF), MuxError::BadDescriptor);
        assert_eq!(MuxError::from_errno(libc::ENOTSOCK), MuxError::BadDescriptor);
        assert_eq!(MuxError::from_errno(libc::EAGAIN), MuxError::WouldBlock);
        assert_eq!(MuxError::from_errno(libc::EINPROGRESS), MuxError::WouldBlock);
        assert_eq!(MuxError::from_errno(libc::EPIPE), MuxError::ConnectionReset);
        assert_eq!(MuxError::from_errno(libc::ENOSYS), MuxError::Unexpected(libc::ENOSYS));
    }

    #[test]
    fn test_mapping_is_pure() {
        // Same input, same kind — no hidden registry state.
        for errno in [libc::EBADF, libc::EINVAL, libc::ETIMEDOUT, 9999] {
            assert_eq!(MuxError::from_errno(errno), MuxError::from_errno(errno));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(MuxError::Canceled.to_string(), "operation canceled");
        assert_eq!(MuxError::Unexpected(77).to_string(), "OS error: errno 77");
    }
}
