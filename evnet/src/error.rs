//! Error types for the evnet runtime.
//!
//! OS failures are carried as [`nix::errno::Errno`] and folded into the
//! crate-level [`Error`] with a total mapping, so callers match on semantic
//! kinds instead of raw error numbers. OpenSSL failures arrive as
//! [`openssl::error::ErrorStack`], which drains the library's thread-local
//! error queue on construction.

use nix::errno::Errno;
use openssl::error::ErrorStack;
use std::io;

/// Result type alias for evnet operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument")]
    BadArgument,

    #[error("out of memory")]
    NoMemory,

    #[error("bad file descriptor")]
    BadDescriptor,

    #[error("too many descriptors")]
    TooManyDescriptors,

    #[error("operation not supported")]
    NotSupported,

    #[error("already bound")]
    AlreadyBound,

    /// The reactor loop is already running on this reactor.
    #[error("main loop already polling")]
    AlreadyPolling,

    #[error("not found")]
    NotFound,

    /// Output buffer is smaller than the produced data.
    #[error("buffer overflow")]
    Overflow,

    #[error("bad format")]
    BadFormat,

    #[error("not a directory")]
    NotADirectory,

    /// Peer certificate verification failed.
    #[error("authentication failure")]
    AuthFailure,

    #[error("protocol error")]
    Protocol,

    #[error("permission denied")]
    Permission,

    /// Interrupted or otherwise retryable condition.
    #[error("transient error, retry")]
    Transient,

    /// OS error with no closer semantic mapping.
    #[error("os error: {0}")]
    Os(Errno),

    /// TLS library error; the error queue was drained into the stack.
    #[error("tls error: {0}")]
    Tls(#[from] ErrorStack),
}

impl Error {
    /// Whether the operation may succeed when retried as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient)
            || matches!(self, Error::Os(e) if *e == Errno::EINTR || *e == Errno::EAGAIN)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        match e {
            Errno::EINVAL => Error::BadArgument,
            Errno::ENOMEM => Error::NoMemory,
            Errno::EBADF => Error::BadDescriptor,
            Errno::EMFILE | Errno::ENFILE => Error::TooManyDescriptors,
            Errno::ENOSYS | Errno::EOPNOTSUPP => Error::NotSupported,
            Errno::EALREADY => Error::AlreadyBound,
            Errno::ENOENT => Error::NotFound,
            Errno::EOVERFLOW => Error::Overflow,
            Errno::ENOTDIR => Error::NotADirectory,
            Errno::EPROTO => Error::Protocol,
            Errno::EPERM | Errno::EACCES => Error::Permission,
            Errno::EINTR | Errno::EAGAIN => Error::Transient,
            other => Error::Os(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Errno::from_raw(code).into(),
            None => match e.kind() {
                io::ErrorKind::NotFound => Error::NotFound,
                io::ErrorKind::PermissionDenied => Error::Permission,
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::BadArgument,
                _ => Error::Protocol,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_semantic_kinds() {
        assert!(matches!(Error::from(Errno::EBADF), Error::BadDescriptor));
        assert!(matches!(Error::from(Errno::EMFILE), Error::TooManyDescriptors));
        assert!(matches!(Error::from(Errno::ENOTDIR), Error::NotADirectory));
        assert!(matches!(Error::from(Errno::EACCES), Error::Permission));
        assert!(matches!(Error::from(Errno::ECONNRESET), Error::Os(_)));
    }

    #[test]
    fn interrupts_are_transient() {
        assert!(Error::from(Errno::EINTR).is_transient());
        assert!(Error::Transient.is_transient());
        assert!(!Error::BadDescriptor.is_transient());
    }
}
