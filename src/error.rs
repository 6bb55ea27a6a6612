use std::io;

/// Errors returned by the shim.
///
/// Every variant maps onto an errno value via [`Error::errno`] so callers
/// that speak POSIX conventions can translate without matching on the enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was submitted to the backend; retry after readiness.
    #[error("operation would block")]
    WouldBlock,
    /// A wait returned before any completion.
    #[error("timed out")]
    TimedOut,
    /// The backend completed the operation with a failure code.
    #[error("backend failure (errno {0})")]
    Backend(i32),
    /// The descriptor does not name a live socket or epoll set.
    #[error("bad descriptor")]
    BadDescriptor,
    /// The socket has no bound local address.
    #[error("socket is not bound")]
    NotBound,
    /// The operation is not supported on this descriptor.
    #[error("operation not supported")]
    Unsupported,
    /// The watched descriptor is already registered with this epoll set.
    #[error("already registered")]
    Exists,
    /// The watched descriptor is not registered with this epoll set.
    #[error("not registered")]
    NotFound,
    /// A host kernel call on a passthrough descriptor failed.
    #[error("host I/O error: {0}")]
    Host(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::WouldBlock => libc::EWOULDBLOCK,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Backend(errno) => *errno,
            Error::BadDescriptor => libc::EBADF,
            Error::NotBound => libc::EINVAL,
            Error::Unsupported => libc::ENOTSUP,
            Error::Exists => libc::EEXIST,
            Error::NotFound => libc::ENOENT,
            Error::Host(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Capture the host errno after a failed libc call.
    pub(crate) fn last_os_error() -> Self {
        Error::Host(io::Error::last_os_error())
    }

    /// Whether this is the transient retry-later class.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}
