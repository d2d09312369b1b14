//! Blocking UDP socket on top of the socket table.
//!
//! Each socket owns a bounded mailbox. The decoder side posts datagrams into
//! it from the dispatch thread; `recv` consumes them. Closing drops the only
//! sender of a separate close channel, which wakes every blocked receiver at
//! once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{select, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use sim7020_metrics::metric_defs;
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::endpoint::Endpoint;
use crate::error::{DriverError, DriverResult};
use crate::table::{ReceiveCallback, SlotEvent, SocketId, SocketTable};

/// Socket creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketFlags(u32);

impl SocketFlags {
    pub const NONE: SocketFlags = SocketFlags(0);
    /// `recv` without a timeout returns `WouldBlock` instead of waiting.
    pub const NONBLOCK: SocketFlags = SocketFlags(1);

    pub fn contains(self, other: SocketFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SocketFlags {
    type Output = SocketFlags;

    fn bitor(self, rhs: SocketFlags) -> SocketFlags {
        SocketFlags(self.0 | rhs.0)
    }
}

/// State shared between a socket and its table callback.
struct Shared {
    closed: AtomicBool,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    receivers: AtomicUsize,
}

impl Shared {
    /// Mark closed and wake every receiver. Returns true on the first call.
    fn shut(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.close_tx.lock().take();
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counts a thread blocked in `recv` for as long as it is alive.
struct ReceiverGuard<'a>(&'a AtomicUsize);

impl<'a> ReceiverGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ReceiverGuard(counter)
    }
}

impl Drop for ReceiverGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A UDP socket on the modem.
pub struct UdpSocket {
    id: SocketId,
    table: Arc<SocketTable>,
    shared: Arc<Shared>,
    mailbox: Receiver<Bytes>,
    local: Mutex<Option<Endpoint>>,
    remote: Mutex<Option<Endpoint>>,
    flags: SocketFlags,
    modem: String,
}

impl UdpSocket {
    /// Open a socket and optionally bind and connect it.
    ///
    /// A failure after the modem socket exists closes it again before the
    /// error is returned.
    pub fn create(
        table: Arc<SocketTable>,
        config: &DriverConfig,
        local: Option<Endpoint>,
        remote: Option<Endpoint>,
        flags: SocketFlags,
    ) -> DriverResult<UdpSocket> {
        let (mail_tx, mailbox) = crossbeam_channel::bounded(config.mailbox_capacity);
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            receivers: AtomicUsize::new(0),
        });

        let callback = mailbox_callback(config.name.clone(), mail_tx, Arc::clone(&shared));
        let id = table.open(callback)?;

        let socket = UdpSocket {
            id,
            table,
            shared,
            mailbox,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            flags,
            modem: config.name.clone(),
        };

        if let Some(local) = local {
            socket.bind(&local)?;
        }
        if let Some(remote) = remote {
            socket.connect(&remote)?;
        }
        Ok(socket)
    }

    /// Modem socket id.
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Threads currently blocked in [`UdpSocket::recv`].
    pub fn pending_receivers(&self) -> usize {
        self.shared.receivers.load(Ordering::SeqCst)
    }

    pub fn bind(&self, local: &Endpoint) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        self.table.bind(self.id, local)?;
        *self.local.lock() = Some(*local);
        Ok(())
    }

    pub fn connect(&self, remote: &Endpoint) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        self.table.connect(self.id, remote)?;
        *self.remote.lock() = Some(*remote);
        Ok(())
    }

    pub fn get_local(&self) -> DriverResult<Endpoint> {
        (*self.local.lock()).ok_or(DriverError::AddressNotAvailable)
    }

    pub fn get_remote(&self) -> DriverResult<Endpoint> {
        (*self.remote.lock()).ok_or(DriverError::NotConnected)
    }

    /// Send a datagram, reconnecting to `remote` first if given.
    ///
    /// Returns the number of bytes accepted, which is less than `data.len()`
    /// when the payload exceeds the configured send limit. Callers chunk
    /// longer messages themselves.
    pub fn send(&self, data: &[u8], remote: Option<&Endpoint>) -> DriverResult<usize> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        match remote {
            Some(remote) => self.connect(remote)?,
            None if self.remote.lock().is_none() => return Err(DriverError::NotConnected),
            None => {}
        }
        self.table.send(self.id, data)
    }

    /// Receive one datagram into `buf`.
    ///
    /// `timeout` of `Some(Duration::ZERO)` never blocks, `None` waits until
    /// data arrives or the socket is closed. A datagram larger than `buf` is
    /// consumed and reported as [`DriverError::BufferTooSmall`].
    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> DriverResult<(usize, Endpoint)> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }

        let timeout = match timeout {
            None if self.flags.contains(SocketFlags::NONBLOCK) => Some(Duration::ZERO),
            other => other,
        };

        let _guard = ReceiverGuard::new(&self.shared.receivers);
        let datagram = match timeout {
            Some(wait) if wait.is_zero() => match self.mailbox.try_recv() {
                Ok(datagram) => datagram,
                Err(TryRecvError::Empty) => return Err(DriverError::WouldBlock),
                Err(TryRecvError::Disconnected) => return Err(DriverError::Closed),
            },
            Some(wait) => select! {
                recv(self.mailbox) -> msg => msg.map_err(|_| DriverError::Closed)?,
                recv(self.shared.close_rx) -> _ => return Err(DriverError::Closed),
                default(wait) => return Err(DriverError::TimedOut),
            },
            None => select! {
                recv(self.mailbox) -> msg => msg.map_err(|_| DriverError::Closed)?,
                recv(self.shared.close_rx) -> _ => return Err(DriverError::Closed),
            },
        };

        if datagram.len() > buf.len() {
            return Err(DriverError::BufferTooSmall {
                needed: datagram.len(),
                capacity: buf.len(),
            });
        }
        buf[..datagram.len()].copy_from_slice(&datagram);

        let source = (*self.remote.lock()).unwrap_or_else(Endpoint::unspecified);
        Ok((datagram.len(), source))
    }

    /// Close the socket. Blocked receivers return [`DriverError::Closed`].
    /// Closing twice is a no-op.
    pub fn close(&self) -> DriverResult<()> {
        if !self.shared.shut() {
            return Ok(());
        }
        debug!("UdpSocket[{}]: closing socket {}", self.modem, self.id);
        self.table.close(self.id)
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("UdpSocket[{}]: close on drop failed for socket {}: {}", self.modem, self.id, e);
        }
    }
}

/// Callback the table invokes for this socket.
fn mailbox_callback(modem: String, mail_tx: Sender<Bytes>, shared: Arc<Shared>) -> ReceiveCallback {
    Arc::new(move |event| match event {
        SlotEvent::Datagram(datagram) => {
            let len = datagram.len();
            match mail_tx.try_send(datagram) {
                Ok(()) => {
                    metrics::counter!(metric_defs::DATAGRAMS_RECEIVED.name, "modem" => modem.clone()).increment(1);
                    metrics::counter!(metric_defs::BYTES_RECEIVED.name, "modem" => modem.clone())
                        .increment(len as u64);
                }
                Err(TrySendError::Full(_)) => {
                    warn!("UdpSocket[{}]: mailbox full, dropping {} byte datagram", modem, len);
                    metrics::counter!(metric_defs::MAILBOX_DROPS.name, "modem" => modem.clone()).increment(1);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        SlotEvent::Invalidated => {
            if shared.shut() {
                debug!("UdpSocket[{}]: socket invalidated", modem);
            }
        }
    })
}
