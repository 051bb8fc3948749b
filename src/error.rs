//! Error taxonomy shared by every channel.

use std::io;
use std::sync::Arc;

/// The result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by channels, groups and pending operations.
///
/// Precondition violations are returned synchronously by the issuing call. Everything else
/// arrives through the operation's [`PendingFuture`] or callback.
///
/// [`PendingFuture`]: crate::PendingFuture
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The channel was closed before or while the operation ran.
    #[error("channel is closed")]
    Closed,

    /// The operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// A deadline passed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The group is terminating and the callback could not be dispatched.
    #[error("channel group is shut down")]
    GroupShutDown,

    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An accept is already outstanding on this listener.
    #[error("an accept is already pending")]
    AcceptPending,

    /// A read is already outstanding on this channel.
    #[error("a read is already pending")]
    ReadPending,

    /// A write is already outstanding on this channel.
    #[error("a write is already pending")]
    WritePending,

    /// A connect is already outstanding on this channel.
    #[error("a connect is already pending")]
    ConnectPending,

    /// The channel was not opened for reading.
    #[error("channel is not readable")]
    NonReadable,

    /// The channel was not opened for writing.
    #[error("channel is not writable")]
    NonWritable,

    /// The socket has no remote peer yet.
    #[error("socket is not connected")]
    NotConnected,

    /// The socket is already connected.
    #[error("socket is already connected")]
    AlreadyConnected,

    /// The listener has no local address yet.
    #[error("listener is not bound")]
    NotBound,

    /// The requested region overlaps a lock this channel already holds.
    #[error("lock overlaps a region already locked by this channel")]
    OverlappingLock,

    /// The channel cannot accept this operation in its current state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// An error reported by the native layer.
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl Error {
    /// Returns `true` if this is [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns `true` if this is [`Error::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            Error::Closed | Error::GroupShutDown => io::ErrorKind::BrokenPipe,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            Error::NotConnected | Error::NotBound => io::ErrorKind::NotConnected,
            Error::AlreadyConnected => io::ErrorKind::AlreadyExists,
            Error::NonReadable | Error::NonWritable => io::ErrorKind::PermissionDenied,
            Error::Io(err) => err.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => match Arc::try_unwrap(inner) {
                Ok(inner) => inner,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            other => io::Error::new(other.kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_round_trip_keeps_kind() {
        let err = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        let cloned = err.clone();
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(io::Error::from(cloned).kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn taxonomy_maps_to_io_kinds() {
        assert_eq!(io::Error::from(Error::Timeout).kind(), io::ErrorKind::TimedOut);
        assert_eq!(
            io::Error::from(Error::InvalidArgument("position")).kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(io::Error::from(Error::AcceptPending).kind(), io::ErrorKind::Other);
    }
}
