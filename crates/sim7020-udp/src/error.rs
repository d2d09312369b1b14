//! Error types for the driver and its command transport.

use std::io;
use std::time::Duration;

use sim7020_at::AtError;
use thiserror::Error;

/// Errors reported by a [`CommandTransport`](crate::CommandTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// No final result code arrived in time.
    #[error("timeout after {timeout:?} waiting for response to {command}")]
    Timeout { command: String, timeout: Duration },

    /// The modem answered with `ERROR` or `+CME ERROR`.
    #[error("modem returned {0}")]
    Modem(String),

    /// The command completed with `OK` but carried no information line.
    #[error("no information line in response to {0}")]
    MissingResponse(String),

    /// The serial link is gone.
    #[error("transport disconnected")]
    Disconnected,

    /// I/O failure on the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the driver and its sockets.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A command exceeded its time budget.
    #[error("command transport timed out: {0}")]
    TransportTimeout(String),

    /// A response did not match the expected grammar.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Only IPv6 endpoints carrying IPv4-mapped addresses are supported.
    #[error("address family not supported")]
    AddressFamilyUnsupported,

    /// Bad argument, such as a zero port.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The modem has no free socket or assigned an id outside the table.
    #[error("out of sockets")]
    OutOfSockets,

    /// The caller's buffer cannot hold the datagram. The datagram is consumed.
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// Non-blocking receive found nothing queued.
    #[error("operation would block")]
    WouldBlock,

    /// Receive timeout elapsed.
    #[error("timed out")]
    TimedOut,

    /// The socket was closed, possibly by another thread or by session loss.
    #[error("socket closed")]
    Closed,

    /// The modem rejected the request.
    #[error("modem unavailable: {0}")]
    Unavailable(String),

    /// Send without a remote endpoint on an unconnected socket.
    #[error("socket not connected")]
    NotConnected,

    /// The socket has no local endpoint.
    #[error("address not available")]
    AddressNotAvailable,

    /// The device reset command failed; bring-up cannot continue.
    #[error("device reset failed: {0}")]
    ResetFailed(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Whether the command channel may hold stale bytes after this error.
    ///
    /// A late reply to a timed-out command would otherwise be read as the
    /// answer to the next one.
    pub fn is_desync(&self) -> bool {
        matches!(self, DriverError::Protocol(_) | DriverError::TransportTimeout(_))
    }
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { .. } => DriverError::TransportTimeout(err.to_string()),
            TransportError::Modem(msg) => DriverError::Unavailable(msg),
            TransportError::MissingResponse(_) => DriverError::Protocol(err.to_string()),
            TransportError::Disconnected => DriverError::Unavailable(err.to_string()),
            TransportError::Io(e) => DriverError::Io(e),
        }
    }
}

impl From<AtError> for DriverError {
    fn from(err: AtError) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_transport_timeout() {
        let err: DriverError = TransportError::Timeout {
            command: "AT+CREG?".to_string(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(err, DriverError::TransportTimeout(_)));
        assert!(err.is_desync());
    }

    #[test]
    fn test_modem_error_maps_to_unavailable() {
        let err: DriverError = TransportError::Modem("ERROR".to_string()).into();
        assert!(matches!(err, DriverError::Unavailable(_)));
        assert!(!err.is_desync());
    }

    #[test]
    fn test_parse_failure_is_protocol_error() {
        let err: DriverError = AtError::ParseError("bad".to_string()).into();
        assert!(matches!(err, DriverError::Protocol(_)));
        assert!(err.is_desync());
    }
}
