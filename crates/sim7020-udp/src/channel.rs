//! Serialized access to the command transport.
//!
//! Every command exchange and every notification dispatch cycle runs under one
//! lock. The socket table lock may be taken while the channel lock is held,
//! never the other way round.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use sim7020_at::{Command, Response};
use sim7020_metrics::metric_defs;
use tracing::{trace, warn};

use crate::error::{DriverError, DriverResult, TransportError};
use crate::transport::{CommandTransport, NotificationHandler};

/// The shared command channel of one modem.
pub struct Channel {
    modem: String,
    transport: Mutex<Box<dyn CommandTransport>>,
}

impl Channel {
    /// Wrap a transport.
    pub fn new(modem: impl Into<String>, transport: Box<dyn CommandTransport>) -> Self {
        Channel {
            modem: modem.into(),
            transport: Mutex::new(transport),
        }
    }

    /// Modem name used in logs and metric labels.
    pub fn modem(&self) -> &str {
        &self.modem
    }

    /// Run `op` with exclusive use of the transport.
    ///
    /// The lock is released on every exit path. If `op` fails with an error
    /// that leaves the link out of step, buffered bytes are drained first.
    pub fn with_channel<T>(&self, op: impl FnOnce(&mut Exchange<'_>) -> DriverResult<T>) -> DriverResult<T> {
        let mut guard = self.transport.lock();
        let mut exchange = Exchange {
            transport: &mut **guard,
            modem: &self.modem,
        };
        let result = op(&mut exchange);

        if let Err(ref e) = result {
            if e.is_desync() {
                warn!("Channel[{}]: draining after {}", self.modem, e);
                guard.drain();
                metrics::counter!(metric_defs::CHANNEL_DRAINS.name, "modem" => self.modem.clone()).increment(1);
            }
        }
        result
    }

    /// One notification dispatch cycle.
    ///
    /// The lock is handed over fairly afterwards so callers waiting to send
    /// are not starved by a background loop calling this back to back.
    pub fn dispatch_cycle(&self, timeout: Duration) -> Result<usize, TransportError> {
        let mut guard = self.transport.lock();
        let result = guard.dispatch_pending(timeout);
        MutexGuard::unlock_fair(guard);
        result
    }

    /// Register a notification handler on the underlying transport.
    pub fn register_notification(&self, prefix: &str, handler: NotificationHandler) {
        self.transport.lock().register_notification(prefix, handler);
    }
}

/// Typed command helpers available inside [`Channel::with_channel`].
pub struct Exchange<'a> {
    transport: &'a mut dyn CommandTransport,
    modem: &'a str,
}

impl Exchange<'_> {
    /// Send a command that only needs `OK`.
    pub fn exec(&mut self, command: &Command) -> DriverResult<()> {
        let line = command.to_command_string();
        let timeout = command.default_timeout();
        let result = self.timed(command, |t| t.send(&line, timeout));
        result.map_err(DriverError::from)
    }

    /// Send a command and parse its first information line.
    pub fn query(&mut self, command: &Command) -> DriverResult<Response> {
        let line = command.to_command_string();
        let timeout = command.default_timeout();
        let text = self.timed(command, |t| t.send_await_response(&line, timeout))?;
        let response = Response::parse(&text)?;
        trace!("Channel[{}]: {} -> {:?}", self.modem, command.name(), response);
        Ok(response)
    }

    /// Send a command and return its first information line verbatim, or
    /// `None` if the modem only answered `OK`.
    pub fn query_text(&mut self, command: &Command) -> DriverResult<Option<String>> {
        let line = command.to_command_string();
        let timeout = command.default_timeout();
        match self.timed(command, |t| t.send_await_response(&line, timeout)) {
            Ok(text) => Ok(Some(text)),
            Err(TransportError::MissingResponse(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn timed<T>(
        &mut self,
        command: &Command,
        op: impl FnOnce(&mut dyn CommandTransport) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let modem = self.modem.to_string();
        let name = command.name();
        metrics::counter!(metric_defs::COMMANDS_SENT.name, "modem" => modem.clone(), "command" => name).increment(1);

        let started = Instant::now();
        let result = op(&mut *self.transport);
        metrics::histogram!(metric_defs::COMMAND_LATENCY.name, "modem" => modem.clone(), "command" => name)
            .record(started.elapsed().as_secs_f64() * 1000.0);

        if let Err(ref e) = result {
            let reason = match e {
                TransportError::Timeout { .. } => "timeout",
                TransportError::Modem(_) => "error",
                TransportError::MissingResponse(_) => "unexpected",
                TransportError::Disconnected | TransportError::Io(_) => "link",
            };
            metrics::counter!(
                metric_defs::COMMANDS_FAILED.name,
                "modem" => modem,
                "command" => name,
                "reason" => reason
            )
            .increment(1);
        }
        result
    }
}
