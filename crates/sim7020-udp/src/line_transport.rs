//! Serial line implementation of [`CommandTransport`].
//!
//! A reader thread pumps raw bytes from the link into a channel; the transport
//! decodes them into lines with [`AtCodec`] on the calling thread. Any line
//! that matches a registered notification prefix is handed to its handler,
//! whether it arrives during a command exchange or during a dispatch cycle.
//!
//! A line longer than [`MAX_LINE_LENGTH`](sim7020_at::MAX_LINE_LENGTH) is dropped whole. If it starts with
//! a registered prefix it is counted as a discarded notification.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use sim7020_at::{is_final_line, AtCodec, AtError};
use sim7020_metrics::metric_defs;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::{CommandTransport, NotificationHandler};

const READ_CHUNK: usize = 256;

/// Modem label used until [`LineTransport::with_name`] is called.
const DEFAULT_NAME: &str = "sim7020";

// ============================================================================
// Reader Thread
// ============================================================================

/// Events sent from the reader thread.
#[derive(Debug)]
enum LinkEvent {
    /// Bytes read from the link.
    Data(Vec<u8>),
    /// The link reported end of file.
    Eof,
    /// The link failed.
    Error(io::Error),
}

fn spawn_reader<R>(mut reader: R, events: Sender<LinkEvent>) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("sim7020-rx".to_string())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let event = match reader.read(&mut buf) {
                    Ok(0) => LinkEvent::Eof,
                    Ok(n) => LinkEvent::Data(buf[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => LinkEvent::Error(e),
                };
                let last = !matches!(event, LinkEvent::Data(_));
                if events.send(event).is_err() || last {
                    break;
                }
            }
        })?;
    Ok(())
}

// ============================================================================
// Line Transport
// ============================================================================

/// AT command transport over any byte stream pair.
pub struct LineTransport<W: Write + Send> {
    writer: W,
    events: Receiver<LinkEvent>,
    codec: AtCodec,
    handlers: Vec<(String, NotificationHandler)>,
    disconnected: bool,
    name: String,
    discarded_notifications: usize,
}

impl<W: Write + Send> LineTransport<W> {
    /// Create a transport and start its reader thread.
    pub fn new<R>(reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_reader(reader, tx)?;
        Ok(LineTransport {
            writer,
            events: rx,
            codec: AtCodec::new(),
            handlers: Vec::new(),
            disconnected: false,
            name: DEFAULT_NAME.to_string(),
            discarded_notifications: 0,
        })
    }

    /// Set the modem name used as metric label. Should match the driver's
    /// configured name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Notifications dropped because they exceeded the line limit.
    pub fn discarded_notifications(&self) -> usize {
        self.discarded_notifications
    }

    /// Whether the link has reported end of file or an error.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn write_command(&mut self, command: &str) -> Result<(), TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        trace!("LineTransport: > {}", command);
        self.codec.set_last_command(command);
        self.writer.write_all(&AtCodec::encode_command(command))?;
        self.writer.flush()?;
        Ok(())
    }

    /// Next complete line, or `None` once `deadline` passes.
    ///
    /// A deadline already in the past still consumes whatever the reader
    /// thread has queued.
    fn next_line(&mut self, deadline: Instant) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.codec.decode_line() {
                trace!("LineTransport: < {}", line);
                return Ok(Some(line));
            }
            if let Err(e) = self.codec.check_overrun() {
                self.discard_overlong(e);
            }
            if self.disconnected {
                return Err(TransportError::Disconnected);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = if remaining.is_zero() {
                match self.events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => return Ok(None),
                    Err(TryRecvError::Disconnected) => LinkEvent::Eof,
                }
            } else {
                match self.events.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => LinkEvent::Eof,
                }
            };

            match event {
                LinkEvent::Data(data) => self.codec.push(&data),
                LinkEvent::Eof => {
                    debug!("LineTransport: link closed");
                    self.disconnected = true;
                }
                LinkEvent::Error(e) => {
                    warn!("LineTransport: read failed: {}", e);
                    self.disconnected = true;
                    return Err(TransportError::Io(e));
                }
            }
        }
    }

    fn discard_overlong(&mut self, err: AtError) {
        let is_notification = match &err {
            AtError::BufferOverflow { head, .. } => {
                self.handlers.iter().any(|(prefix, _)| head.starts_with(prefix.as_str()))
            }
            _ => false,
        };
        if !is_notification {
            warn!("LineTransport[{}]: dropping line: {}", self.name, err);
            return;
        }

        warn!("LineTransport[{}]: dropping notification: {}", self.name, err);
        self.discarded_notifications += 1;
        metrics::counter!(
            metric_defs::URC_DISCARDED.name,
            "modem" => self.name.clone(),
            "reason" => "too_large"
        )
        .increment(1);
    }

    /// Hand `line` to the first handler whose prefix matches.
    fn route_notification(&mut self, line: &str) -> bool {
        match self.handlers.iter_mut().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            Some((_, handler)) => {
                handler(line);
                true
            }
            None => false,
        }
    }

    /// Run one command exchange and collect its information lines.
    fn exchange(&mut self, command: &str, timeout: Duration) -> Result<Vec<String>, TransportError> {
        self.write_command(command)?;
        let deadline = Instant::now() + timeout;
        let mut info = Vec::new();

        loop {
            let line = match self.next_line(deadline)? {
                Some(line) => line,
                None => {
                    return Err(TransportError::Timeout {
                        command: command.to_string(),
                        timeout,
                    })
                }
            };

            if self.route_notification(&line) {
                continue;
            }
            // Echo that slipped past the codec, e.g. after a partial read.
            if line == command {
                continue;
            }
            if line == "OK" {
                self.codec.clear_echo();
                return Ok(info);
            }
            if is_final_line(&line) {
                self.codec.clear_echo();
                return Err(TransportError::Modem(line));
            }
            info.push(line);
        }
    }
}

impl<W: Write + Send> CommandTransport for LineTransport<W> {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<(), TransportError> {
        let info = self.exchange(command, timeout)?;
        for line in info {
            trace!("LineTransport: ignoring information line '{}' for {}", line, command);
        }
        Ok(())
    }

    fn send_await_response(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.exchange(command, timeout)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::MissingResponse(command.to_string()))
    }

    fn register_notification(&mut self, prefix: &str, handler: NotificationHandler) {
        self.handlers.push((prefix.to_string(), handler));
    }

    fn dispatch_pending(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let mut deadline = Instant::now() + timeout;
        let mut dispatched = 0;

        while let Some(line) = self.next_line(deadline)? {
            if self.route_notification(&line) {
                dispatched += 1;
            } else {
                debug!("LineTransport: discarding unsolicited line '{}'", line);
            }
            // After the first line only drain what is already queued.
            deadline = Instant::now();
        }

        Ok(dispatched)
    }

    fn drain(&mut self) {
        let mut discarded = self.codec.buffered_len();
        self.codec.clear();
        while let Ok(event) = self.events.try_recv() {
            match event {
                LinkEvent::Data(data) => discarded += data.len(),
                LinkEvent::Eof | LinkEvent::Error(_) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        debug!("LineTransport: drained {} bytes", discarded);
    }
}
