//! Error types for the stream client.
//!
//! Nothing in this crate is fatal to the process. Every failure degrades to
//! "this one line was skipped" or "this one message is incomplete/annotated",
//! and the session keeps running.

use sage_stream_core::MessageId;
use thiserror::Error;

use crate::lifecycle::SessionState;

/// Failure category reported to the collaborator through `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// One malformed line was skipped.
    LineParse,
    /// One chunk frame failed its integrity check.
    ChecksumMismatch,
    /// A chunked payload could not be reassembled.
    Reassembly,
    /// The connection to the backend failed.
    Transport,
}

impl ErrorKind {
    /// Short name used in logs and collaborator callbacks.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LineParse => "line_parse",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Reassembly => "reassembly",
            Self::Transport => "transport",
        }
    }
}

/// Errors raised while decoding and routing the stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A line was not valid JSON, or not a valid envelope.
    #[error("malformed line: {reason}")]
    LineParse {
        /// Parser error text.
        reason: String,
        /// The offending line, for diagnostics.
        line: String,
    },

    /// A chunk frame's checksum did not match its payload.
    #[error("checksum mismatch for {message_id} chunk {chunk_index}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Message the chunk belongs to.
        message_id: MessageId,
        /// Index of the rejected chunk.
        chunk_index: usize,
        /// Checksum carried by the frame.
        expected: i64,
        /// Checksum computed locally.
        actual: i64,
    },

    /// A chunk frame was structurally invalid (e.g. index out of range).
    #[error("invalid chunk frame for {message_id}: {reason}")]
    InvalidFrame {
        /// Message the frame belongs to.
        message_id: MessageId,
        /// What was wrong with it.
        reason: String,
    },

    /// A completed chunk stream did not yield a valid JSON payload.
    #[error("reassembly failed for {message_id}: {reason}")]
    Reassembly {
        /// Message the stream belonged to.
        message_id: MessageId,
        /// Why reassembly failed.
        reason: String,
        /// The concatenated payload, for diagnostics.
        raw: String,
    },

    /// A chunk stream was still incomplete when the stream ended.
    #[error("chunk stream for {message_id} dropped with {received}/{total} chunks")]
    DroppedStream {
        /// Message the stream belonged to.
        message_id: MessageId,
        /// Chunks received before the drop.
        received: usize,
        /// Chunks announced.
        total: usize,
    },

    /// The transport failed mid-stream.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl StreamError {
    /// The category reported to the collaborator.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::LineParse { .. } => ErrorKind::LineParse,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::InvalidFrame { .. } | Self::Reassembly { .. } | Self::DroppedStream { .. } => {
                ErrorKind::Reassembly
            }
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// The message this error is tied to, if any.
    #[must_use]
    pub const fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::ChecksumMismatch { message_id, .. }
            | Self::InvalidFrame { message_id, .. }
            | Self::Reassembly { message_id, .. }
            | Self::DroppedStream { message_id, .. } => Some(message_id),
            Self::LineParse { .. } | Self::Transport(_) => None,
        }
    }

    /// Returns true if the read loop continues after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("backend error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text from the response body.
        message: String,
    },

    /// The stream ended before the terminal marker.
    #[error("stream closed before stream_end")]
    Closed,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// A result type using `SessionError`.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors returned by [`SessionController`](crate::session::SessionController) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `send` was called with no text.
    #[error("cannot send an empty message")]
    EmptyMessage,

    /// The requested state transition is not valid.
    #[error("invalid session state transition: cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// The current state.
        from: SessionState,
        /// The requested target state.
        to: SessionState,
    },

    /// Opening the stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
