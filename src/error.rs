//! Error types for the RESP client core.
//!
//! A single [`Error`] enum covers every failure class the connection layers
//! can surface. Errors are `Clone` so one fatal error can be recorded as the
//! connection's sticky error and still be delivered to every pending
//! callback.

use std::io;

/// Error type for reader and connection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Transport read or write failure. The original `io::ErrorKind` is
    /// preserved so callers can inspect the platform error class.
    #[error("I/O error: {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },

    /// The peer closed the connection cleanly.
    #[error("server closed the connection")]
    Eof,

    /// Malformed RESP stream. Always fatal to the connection that saw it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A buffering or allocation limit was exceeded.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// No response arrived within the configured deadline.
    #[error("operation timed out")]
    Timeout,

    /// Everything else, with a descriptive message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true if this is a protocol violation.
    #[inline]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Returns true if this is a timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Returns the underlying `io::ErrorKind` for I/O failures.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // Blocking sockets report an expired read/write deadline as
            // WouldBlock on Unix and TimedOut on Windows.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            kind => Error::Io {
                kind,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let e: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert_eq!(e.io_kind(), Some(io::ErrorKind::ConnectionReset));
        assert!(format!("{e}").contains("reset by peer"));
    }

    #[test]
    fn test_timeout_conversion() {
        let e: Error = io::Error::new(io::ErrorKind::WouldBlock, "would block").into();
        assert_eq!(e, Error::Timeout);
        assert!(e.is_timeout());

        let e: Error = io::Error::new(io::ErrorKind::TimedOut, "timed out").into();
        assert_eq!(e, Error::Timeout);
    }

    #[test]
    fn test_eof_conversion() {
        let e: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(e, Error::Eof);
    }

    #[test]
    fn test_protocol_display() {
        let e = Error::Protocol("unknown reply type byte 'x'".to_string());
        assert!(e.is_protocol());
        assert_eq!(
            format!("{e}"),
            "protocol error: unknown reply type byte 'x'"
        );
    }

    #[test]
    fn test_clone_eq() {
        let e = Error::Protocol("bad".to_string());
        assert_eq!(e.clone(), e);
        assert_ne!(e, Error::Eof);
    }
}
