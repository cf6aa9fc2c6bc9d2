//! Unified error handling for chanpool.
//!
//! Every public operation returns [`Error`]. The type is `Clone` so the
//! sentinels (closed, stopped, reconnect) and the stored close result of a
//! [`Connection`](crate::Connection) can be handed to any number of callers.

use std::sync::Arc;

use thiserror::Error;

use crate::proto::ProtocolError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by connections, pools and their calls.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection was closed before or while the call was handled.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server asked us to reconnect. Not fatal for the caller's session;
    /// a fresh connection may be dialed.
    #[error("server requested reconnect")]
    ReconnectRequested,

    /// The identity is configured read-only and cannot send messages.
    #[error("connection is read-only")]
    ReadOnly,

    /// The pool was stopped or its scope ended.
    #[error("pool stopped")]
    PoolStopped,

    /// The caller's cancellation scope ended first.
    #[error("operation cancelled")]
    Cancelled,

    /// The owning loop discarded the call without completing it.
    #[error("call dropped before completion")]
    CallDropped,

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Eof,

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("tls: {0}")]
    Tls(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Fatal codec error (I/O failure or over-long line).
    #[error("protocol: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Wrap an I/O error with a short context string.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            context,
            source: Arc::new(source),
        }
    }

    pub fn dial(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source: Arc::new(source),
        }
    }

    /// Whether this is the server-initiated reconnect request.
    #[inline]
    pub fn is_reconnect(&self) -> bool {
        matches!(self, Self::ReconnectRequested)
    }

    /// Static label for logs and metrics.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "connection_closed",
            Self::ReconnectRequested => "reconnect_requested",
            Self::ReadOnly => "read_only",
            Self::PoolStopped => "pool_stopped",
            Self::Cancelled => "cancelled",
            Self::CallDropped => "call_dropped",
            Self::Eof => "eof",
            Self::Dial { .. } => "dial",
            Self::Tls(_) => "tls",
            Self::Io { .. } => "io",
            Self::Protocol(_) => "protocol",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::io("transport", e),
            other => Self::Protocol(Arc::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_source() {
        let err = Error::io(
            "write",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe"),
        );
        assert_eq!(err.to_string(), "write: broken pipe");
        let source = std::error::Error::source(&err);
        assert_eq!(source.map(|s| s.to_string()).as_deref(), Some("broken pipe"));
    }

    #[test]
    fn test_protocol_io_is_flattened() {
        let err: Error = ProtocolError::Io(std::io::Error::other("reset")).into();
        assert_eq!(err.error_code(), "io");

        let err: Error = ProtocolError::MessageTooLong {
            actual: 9000,
            limit: 8191,
        }
        .into();
        assert_eq!(err.error_code(), "protocol");
    }

    #[test]
    fn test_sentinels_are_stable() {
        let a = Error::ConnectionClosed;
        let b = a.clone();
        assert_eq!(a.to_string(), b.to_string());
        assert!(Error::ReconnectRequested.is_reconnect());
        assert!(!Error::Eof.is_reconnect());
    }
}
