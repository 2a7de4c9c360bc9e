//! Crate-wide error type covering the socket, fork codec, and transfer clients.

use std::io;

/// Every failure mode this crate's public API can return.
///
/// Callers match on the variant rather than inspecting a message string; the
/// `Display` impl (derived by `thiserror`) still produces a readable message
/// for logs.
#[derive(Debug, thiserror::Error)]
pub enum HotlineError {
    /// An operation was issued before the socket reached a ready state.
    #[error("socket is not ready")]
    NotReady,

    /// The peer closed the connection, or `close()` was called locally.
    #[error("connection closed")]
    Closed,

    /// A port outside the valid range was supplied.
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// The underlying network stack reported an error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// EOF arrived before the requested number of bytes were buffered.
    #[error("insufficient data: expected {expected} bytes, got {got}")]
    InsufficientData {
        /// Bytes the caller asked for.
        expected: usize,
        /// Bytes actually available before EOF.
        got: usize,
    },

    /// A delimiter search or buffer growth exceeded the configured cap.
    #[error("framing exceeded maximum of {max} bytes")]
    FramingExceeded {
        /// The buffer cap that was exceeded.
        max: usize,
    },

    /// A header or info-fork payload failed to decode.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// A header or info-fork payload failed to encode.
    #[error("encode failed: {0}")]
    EncodeFailed(String),

    /// A transfer-level protocol violation (unknown folder action, malformed
    /// fork sequence, unexpected handshake response).
    #[error("transfer failed: {0}")]
    FailedToTransfer(String),

    /// The caller or a progress-stream consumer aborted the transfer.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HotlineError>;
