//! Inbound `+CSONMI` notification decoder.
//!
//! Runs inside the transport's notification dispatch with the channel lock
//! held. Each payload is decoded into its own buffer and moved to the owning
//! socket, so a slow receiver never sees its data overwritten by the next
//! notification.

use std::sync::Arc;

use sim7020_at::SocketDataUrc;
use sim7020_metrics::metric_defs;
use tracing::{debug, trace, warn};

use crate::config::DriverConfig;
use crate::table::{SlotEvent, SocketTable};
use crate::transport::NotificationHandler;

/// What happened to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the owning socket.
    Delivered,
    /// Socket id outside the table.
    OutOfRange,
    /// Payload larger than the receive buffer.
    TooLarge,
    /// Not a valid notification, odd length or non-hex data.
    Malformed,
    /// No socket open under that id.
    NoReceiver,
}

impl Disposition {
    /// Metric label for a discarded notification.
    pub fn reason(&self) -> &'static str {
        match self {
            Disposition::Delivered => "delivered",
            Disposition::OutOfRange => "out_of_range",
            Disposition::TooLarge => "too_large",
            Disposition::Malformed => "malformed",
            Disposition::NoReceiver => "no_receiver",
        }
    }
}

/// Routes socket data notifications to the socket table.
pub struct InboundDecoder {
    table: Arc<SocketTable>,
    max_recv_len: usize,
    modem: String,
}

impl InboundDecoder {
    pub fn new(table: Arc<SocketTable>, config: &DriverConfig) -> Self {
        InboundDecoder {
            table,
            max_recv_len: config.max_recv_len,
            modem: config.name.clone(),
        }
    }

    /// Decode one notification line and deliver it.
    pub fn handle_line(&self, line: &str) -> Disposition {
        let disposition = self.decode_and_deliver(line);
        if disposition == Disposition::Delivered {
            metrics::counter!(metric_defs::URC_DELIVERED.name, "modem" => self.modem.clone()).increment(1);
        } else {
            metrics::counter!(
                metric_defs::URC_DISCARDED.name,
                "modem" => self.modem.clone(),
                "reason" => disposition.reason()
            )
            .increment(1);
        }
        disposition
    }

    fn decode_and_deliver(&self, line: &str) -> Disposition {
        let urc = match SocketDataUrc::parse(line) {
            Ok(urc) => urc,
            Err(e) => {
                warn!("InboundDecoder[{}]: discarding '{}': {}", self.modem, line, e);
                return Disposition::Malformed;
            }
        };

        if urc.socket as usize >= self.table.capacity() {
            warn!("InboundDecoder[{}]: socket id {} out of range, discarding", self.modem, urc.socket);
            return Disposition::OutOfRange;
        }

        let len = match urc.payload_len() {
            Ok(len) => len,
            Err(e) => {
                warn!("InboundDecoder[{}]: socket {}: {}", self.modem, urc.socket, e);
                return Disposition::Malformed;
            }
        };
        if len > self.max_recv_len {
            warn!(
                "InboundDecoder[{}]: socket {}: {} byte payload exceeds {} byte buffer, discarding",
                self.modem, urc.socket, len, self.max_recv_len
            );
            return Disposition::TooLarge;
        }

        let payload = match urc.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("InboundDecoder[{}]: socket {}: {}", self.modem, urc.socket, e);
                return Disposition::Malformed;
            }
        };

        let Some(callback) = self.table.lookup(urc.socket) else {
            debug!("InboundDecoder[{}]: no receiver on socket {}, discarding {} bytes", self.modem, urc.socket, len);
            return Disposition::NoReceiver;
        };

        trace!("InboundDecoder[{}]: {} bytes for socket {}", self.modem, len, urc.socket);
        callback(SlotEvent::Datagram(payload));
        Disposition::Delivered
    }

    /// Turn the decoder into a transport notification handler.
    pub fn into_handler(self) -> NotificationHandler {
        Box::new(move |line| {
            self.handle_line(line);
        })
    }
}
