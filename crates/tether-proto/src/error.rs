//! Error types for the protocol library.

use thiserror::Error;

/// Convenience alias for results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The non-tag portion of a line exceeded the 512-byte budget.
    #[error("line too long: {actual} bytes (limit: {limit})")]
    LineTooLong {
        /// Actual length in bytes.
        actual: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// The tag section exceeded the 8191-byte budget.
    #[error("tags too long: {actual} bytes (limit: {limit})")]
    TagsTooLong {
        /// Actual length in bytes.
        actual: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// A line contained bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in line at byte {byte_pos}")]
    InvalidUtf8 {
        /// Byte offset where validation failed.
        byte_pos: usize,
    },

    /// An outbound message contained an interior CR, LF, or NUL.
    #[error("illegal control character: {0:?}")]
    IllegalControlChar(char),

    /// Failed to parse a line into a message.
    #[error("invalid message {string:?}: {cause}")]
    InvalidMessage {
        /// The offending line.
        string: String,
        /// What went wrong.
        cause: MessageParseError,
    },
}

/// Errors encountered while parsing a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MessageParseError {
    /// The line was empty after stripping CRLF.
    #[error("empty message")]
    EmptyMessage,

    /// No command token was present.
    #[error("missing command")]
    MissingCommand,

    /// The command was neither letters nor a three-digit numeric.
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),

    /// A tag had an empty key (`@=value` or `@;`).
    #[error("empty tag key")]
    EmptyTagKey,
}
