//! QMP error types

use crate::types::ErrorInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QmpError {
    /// Socket-level failure (refused, reset, unexpected EOF).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The first inbound message was not a valid greeting.
    #[error("invalid greeting: {raw}")]
    InvalidGreeting { raw: String },

    /// An inbound message did not parse as JSON.
    #[error("unparsable response: {raw}")]
    Parse { raw: String },

    /// The hypervisor returned an `{"error": ...}` envelope.
    #[error("command failed: {0}")]
    Command(ErrorInfo),

    /// A response payload did not match the command's expected shape.
    #[error("unexpected payload for {command}: {source}")]
    Payload {
        command: &'static str,
        source: serde_json::Error,
    },

    /// No response arrived within the command timeout.
    #[error("command timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The session is closed or a previous failure faulted it.
    #[error("session is not ready (state: {state})")]
    NotReady { state: &'static str },
}

pub type Result<T> = std::result::Result<T, QmpError>;
