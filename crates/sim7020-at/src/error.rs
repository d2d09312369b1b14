//! Error types for the AT protocol.

use thiserror::Error;

/// Errors that can occur when working with the AT protocol.
#[derive(Debug, Error)]
pub enum AtError {
    /// Failed to parse a response or notification.
    #[error("failed to parse response: {0}")]
    ParseError(String),

    /// A line grew past the codec limit without a terminator and was dropped.
    #[error("line overflow: more than {max} bytes, {actual} buffered, starting with '{head}'")]
    BufferOverflow {
        max: usize,
        actual: usize,
        /// The first bytes of the dropped line.
        head: String,
    },
}

/// Result type alias for AT operations.
pub type AtResult<T> = Result<T, AtError>;
