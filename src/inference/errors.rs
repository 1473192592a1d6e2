//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to
//! build meaningful log entries.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur during non-streaming inference calls or while
/// opening a generation stream.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The request never produced a usable response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// SSE framing or chunk-level error.
    #[error("stream error: {reason}")]
    Stream { reason: String },

    /// The model answered with no content.
    #[error("empty response from {endpoint}")]
    EmptyResponse { endpoint: String },

    /// The response body had an unexpected shape.
    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
}

impl InferenceError {
    /// Whether the underlying transport failure was transient.
    pub fn is_retriable(&self) -> bool {
        matches!(self, InferenceError::Transport(e) if e.is_retriable())
    }
}
