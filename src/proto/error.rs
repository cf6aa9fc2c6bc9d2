use thiserror::Error;

/// Errors produced while framing or parsing protocol lines.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded the configured maximum length.
    #[error("message too long: {actual} bytes (limit: {limit})")]
    MessageTooLong { actual: usize, limit: usize },

    /// A complete line could not be parsed into a message.
    #[error("invalid message {line:?}: {reason}")]
    InvalidMessage { line: String, reason: &'static str },
}

impl ProtocolError {
    /// Recoverable errors concern a single line; the stream stays usable.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidMessage { .. })
    }
}
