//! Protocol error types.

use thiserror::Error;

use crate::header::MessageKind;

/// Result type for channel operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing or transferring messages.
///
/// Everything except [`ProtocolError::Io`] on a transient condition is fatal
/// for the channel it happened on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection on a frame boundary.
    #[error("peer closed the connection")]
    Closed,

    /// The peer closed the connection in the middle of a frame.
    #[error("truncated frame: expected {expected} bytes, got {received}")]
    Truncated { expected: usize, received: usize },

    /// The header carries a kind tag we do not know.
    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    /// Declared payload length is over the limit.
    #[error("payload of {length} bytes exceeds limit of {max}")]
    PayloadTooLarge { length: usize, max: usize },

    /// More descriptors than a single frame may carry.
    #[error("{count} handles exceed limit of {max}")]
    TooManyHandles { count: usize, max: usize },

    /// Descriptors received do not match the count the header declared.
    #[error("header declared {declared} handles, received {received}")]
    HandleMismatch { declared: usize, received: usize },

    /// The kernel dropped ancillary data because the buffer was too small.
    #[error("ancillary data truncated")]
    AncillaryTruncated,

    /// A valid message arrived where a different kind was required.
    #[error("unexpected {received} message, expected {expected}")]
    UnexpectedKind {
        expected: MessageKind,
        received: MessageKind,
    },
}

impl ProtocolError {
    /// Whether the error ends the conversation on this channel.
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, Self::UnexpectedKind { .. })
    }
}
