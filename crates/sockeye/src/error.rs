use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Universal error classification. Syscall errnos are folded into these
/// kinds through [`Error::from_errno`]; user-visible failures never expose
/// raw platform values.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    #[error("operation would block")]
    WouldBlock,
    #[error("operation interrupted")]
    Interrupted,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not authorized")]
    NotAuthorized,
    #[error("unreachable")]
    Unreachable,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("address in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("message too large")]
    MessageSize,
    #[error("resource limit reached")]
    Limit,
    #[error("end of file")]
    EndOfFile,
    #[error("not supported")]
    Unsupported,
    #[error("internal error")]
    Internal,
}

/// An error kind plus the originating errno, when one exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    errno: Option<i32>,
}

impl Error {
    #[inline]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, errno: None }
    }

    /// Classifies a platform errno.
    pub fn from_errno(errno: i32) -> Self {
        let kind = match errno {
            libc::EWOULDBLOCK | libc::EINPROGRESS => ErrorKind::WouldBlock,
            libc::EINTR => ErrorKind::Interrupted,
            libc::ECANCELED => ErrorKind::Cancelled,
            libc::ETIMEDOUT => ErrorKind::TimedOut,
            libc::EINVAL | libc::EBADF | libc::ENOTSOCK | libc::EFAULT | libc::EDESTADDRREQ => {
                ErrorKind::InvalidArgument
            }
            libc::EACCES | libc::EPERM => ErrorKind::NotAuthorized,
            libc::ENETUNREACH | libc::EHOSTUNREACH | libc::ENETDOWN | libc::EHOSTDOWN => {
                ErrorKind::Unreachable
            }
            libc::ECONNRESET | libc::ECONNABORTED | libc::EPIPE => ErrorKind::ConnectionReset,
            libc::ECONNREFUSED => ErrorKind::ConnectionRefused,
            libc::EADDRINUSE => ErrorKind::AddressInUse,
            libc::EADDRNOTAVAIL => ErrorKind::AddressNotAvailable,
            libc::EMSGSIZE => ErrorKind::MessageSize,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::ENOSPC => {
                ErrorKind::Limit
            }
            libc::ENOTSUP
            | libc::ENOPROTOOPT
            | libc::EAFNOSUPPORT
            | libc::EPROTONOSUPPORT
            | libc::ESOCKTNOSUPPORT => ErrorKind::Unsupported,
            _ => ErrorKind::Internal,
        };
        Self { kind, errno: Some(errno) }
    }

    /// Classifies the thread's current errno.
    pub fn last_os_error() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub const fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// Soft signals that re-arm readiness instead of failing the operation.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{} (errno {errno})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
