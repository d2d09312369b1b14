//! The command/response primitive the driver is built on.

use std::time::Duration;

use crate::error::TransportError;

/// Handler for an unsolicited line. Runs on whichever thread drives the
/// transport, while the channel lock is held, so it must not block.
pub type NotificationHandler = Box<dyn FnMut(&str) + Send>;

/// A line-oriented AT command transport.
///
/// Implementations route unsolicited lines matching a registered prefix to
/// their handler at any time they read from the link, including while a
/// command exchange is in progress.
pub trait CommandTransport: Send {
    /// Send a command and wait for `OK`.
    fn send(&mut self, command: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Send a command, wait for `OK` and return its first information line.
    fn send_await_response(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Register a handler for lines starting with `prefix`.
    fn register_notification(&mut self, prefix: &str, handler: NotificationHandler);

    /// Wait up to `timeout` for unsolicited lines and dispatch them.
    ///
    /// Returns the number of lines handed to a handler.
    fn dispatch_pending(&mut self, timeout: Duration) -> Result<usize, TransportError>;

    /// Discard everything buffered on the link.
    fn drain(&mut self);
}
