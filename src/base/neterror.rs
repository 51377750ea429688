use std::io;
use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Every asynchronous operation in this crate reports failure through a
/// callback carrying one of these values; nothing unwinds. The variants are
/// deliberately few: transient per-address connect errors collapse into
/// [`NetError::ConnectionRefused`] / [`NetError::ConnectFailed`] with the OS
/// errno preserved, and a graceful peer shutdown is kept distinct from a
/// hard I/O error because end-of-stream is not necessarily a failure of the
/// protocol above.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("unknown host")]
    NameNotResolved,
    #[error("connection refused")]
    ConnectionRefused { errno: Option<i32> },
    #[error("could not connect to any address")]
    ConnectFailed { errno: Option<i32> },
    #[error("operation timed out")]
    TimedOut,
    #[error("peer closed the connection")]
    RemoteClosed,
    #[error("network i/o error")]
    Io { errno: Option<i32> },
    #[error("no pooled connection became available in time")]
    BorrowTimeout,
    #[error("invalid endpoint, expected host:port")]
    BadEndpoint,
    #[error("connection pool is shut down")]
    PoolClosed,
    #[error("internal error")]
    Internal,
}

impl NetError {
    /// Classifies an error raised while connecting to one candidate
    /// address. These are the retriable ones: the connect job advances to
    /// the next address and only surfaces the last of them.
    pub fn from_connect(err: &io::Error) -> Self {
        let errno = err.raw_os_error();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused { errno },
            io::ErrorKind::TimedOut => NetError::TimedOut,
            _ => NetError::ConnectFailed { errno },
        }
    }

    /// Classifies an error raised on an established connection.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => NetError::RemoteClosed,
            _ => NetError::Io { errno: err.raw_os_error() },
        }
    }

    /// The OS-level errno recorded with this error, if any.
    pub fn os_errno(&self) -> Option<i32> {
        match self {
            NetError::ConnectionRefused { errno }
            | NetError::ConnectFailed { errno }
            | NetError::Io { errno } => *errno,
            _ => None,
        }
    }

    /// True for the dedicated timeout kind (deadline or borrow timer).
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::TimedOut | NetError::BorrowTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_classification() {
        let refused = io::Error::from_raw_os_error(libc_econnrefused());
        match NetError::from_connect(&refused) {
            NetError::ConnectionRefused { errno } => assert_eq!(errno, Some(libc_econnrefused())),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn io_error_keeps_errno() {
        let err = io::Error::from_raw_os_error(libc_epipe());
        let mapped = NetError::from_io(&err);
        assert_eq!(mapped.os_errno(), Some(libc_epipe()));
    }

    #[test]
    fn reset_maps_to_remote_closed() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(NetError::from_io(&err), NetError::RemoteClosed);
        assert_eq!(NetError::RemoteClosed.os_errno(), None);
    }

    #[test]
    fn timeout_kinds() {
        assert!(NetError::TimedOut.is_timeout());
        assert!(NetError::BorrowTimeout.is_timeout());
        assert!(!NetError::RemoteClosed.is_timeout());
    }

    fn libc_econnrefused() -> i32 {
        111
    }

    fn libc_epipe() -> i32 {
        32
    }
}
