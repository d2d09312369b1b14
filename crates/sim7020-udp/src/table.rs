//! Socket table.
//!
//! Slot index and modem-assigned socket id are the same number, so the modem
//! bounds the table: an id at or above `max_sockets` cannot be tracked.
//! A slot is in use while it holds a receive callback. Clearing the callback
//! before the close command goes out guarantees no notification reaches a
//! socket that is being torn down.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sim7020_at::{Command, Response};
use sim7020_metrics::metric_defs;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::DriverConfig;
use crate::endpoint::Endpoint;
use crate::error::{DriverError, DriverResult};

/// What the table hands to a socket's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    /// A decoded datagram, owned by the receiver.
    Datagram(Bytes),
    /// The slot was released without the owner closing it.
    Invalidated,
}

/// Per-socket receive callback.
pub type ReceiveCallback = Arc<dyn Fn(SlotEvent) + Send + Sync>;

/// Local handle of an open slot, equal to the modem's socket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u8);

impl SocketId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn modem_id(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum SlotState {
    Free,
    Open(ReceiveCallback),
    /// Callback cleared, close command not yet answered.
    Closing,
}

/// Tracks the sockets open on one modem.
pub struct SocketTable {
    channel: Arc<Channel>,
    slots: Mutex<Vec<SlotState>>,
    max_send_len: usize,
}

impl SocketTable {
    pub fn new(channel: Arc<Channel>, config: &DriverConfig) -> Self {
        let slots = (0..config.max_sockets).map(|_| SlotState::Free).collect();
        SocketTable {
            channel,
            slots: Mutex::new(slots),
            max_send_len: config.max_send_len,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of slots in use.
    pub fn open_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| !matches!(s, SlotState::Free))
            .count()
    }

    fn modem(&self) -> &str {
        self.channel.modem()
    }

    fn record_open_count(&self, count: usize) {
        metrics::gauge!(metric_defs::OPEN_SOCKETS.name, "modem" => self.modem().to_string()).set(count as f64);
    }

    // ========================================================================
    // Open / Close
    // ========================================================================

    /// Create a socket on the modem and store `callback` in its slot.
    pub fn open(&self, callback: ReceiveCallback) -> DriverResult<SocketId> {
        let (id, displaced, open) = self.channel.with_channel(|ex| {
            let socket = match ex.query(&Command::SocketCreate)? {
                Response::SocketCreated { socket } => socket,
                other => {
                    return Err(DriverError::Protocol(format!("unexpected reply to AT+CSOC: {:?}", other)));
                }
            };

            let mut slots = self.slots.lock();
            let id = match u8::try_from(socket) {
                Ok(id) if usize::from(id) < slots.len() => id,
                _ => {
                    drop(slots);
                    warn!("SocketTable[{}]: modem assigned socket {} outside table", self.modem(), socket);
                    if let Ok(id) = u8::try_from(socket) {
                        if let Err(e) = ex.exec(&Command::SocketClose { socket: id }) {
                            warn!("SocketTable[{}]: failed to release socket {}: {}", self.modem(), socket, e);
                        }
                    }
                    return Err(DriverError::OutOfSockets);
                }
            };
            let index = usize::from(id);

            let displaced = match std::mem::replace(&mut slots[index], SlotState::Open(callback)) {
                SlotState::Open(old) => Some(old),
                SlotState::Free | SlotState::Closing => None,
            };
            let open = slots.iter().filter(|s| !matches!(s, SlotState::Free)).count();
            Ok((SocketId(id), displaced, open))
        })?;

        if let Some(old) = displaced {
            warn!("SocketTable[{}]: modem reused socket {}, invalidating previous owner", self.modem(), id);
            old(SlotEvent::Invalidated);
        }
        self.record_open_count(open);
        debug!("SocketTable[{}]: opened socket {}", self.modem(), id);
        Ok(id)
    }

    /// Close a socket. Closing a slot that is not open does nothing.
    pub fn close(&self, id: SocketId) -> DriverResult<()> {
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id.index()) else {
                return Ok(());
            };
            if !matches!(slot, SlotState::Open(_)) {
                return Ok(());
            }
            *slot = SlotState::Closing;
        }

        let result = self
            .channel
            .with_channel(|ex| ex.exec(&Command::SocketClose { socket: id.modem_id() }));

        let open = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(id.index()) {
                if matches!(slot, SlotState::Closing) {
                    *slot = SlotState::Free;
                }
            }
            slots.iter().filter(|s| !matches!(s, SlotState::Free)).count()
        };
        self.record_open_count(open);

        match result {
            Ok(()) => {
                debug!("SocketTable[{}]: closed socket {}", self.modem(), id);
                Ok(())
            }
            Err(e) => {
                warn!("SocketTable[{}]: close of socket {} failed: {}", self.modem(), id, e);
                Err(e)
            }
        }
    }

    /// Release every slot without talking to the modem and tell each owner.
    ///
    /// Used when the packet context is lost and the modem's sockets are gone.
    pub fn invalidate_all(&self) {
        let callbacks: Vec<ReceiveCallback> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, SlotState::Free) {
                    SlotState::Open(cb) => Some(cb),
                    SlotState::Free | SlotState::Closing => None,
                })
                .collect()
        };

        if !callbacks.is_empty() {
            info!("SocketTable[{}]: invalidating {} open sockets", self.modem(), callbacks.len());
        }
        for callback in callbacks {
            callback(SlotEvent::Invalidated);
        }
        self.record_open_count(0);
    }

    /// Callback registered for a modem socket id, if the slot is open.
    pub fn lookup(&self, socket: u32) -> Option<ReceiveCallback> {
        let slots = self.slots.lock();
        match slots.get(usize::try_from(socket).ok()?) {
            Some(SlotState::Open(cb)) => Some(Arc::clone(cb)),
            _ => None,
        }
    }

    fn ensure_open(&self, id: SocketId) -> DriverResult<()> {
        match self.slots.lock().get(id.index()) {
            Some(SlotState::Open(_)) => Ok(()),
            _ => Err(DriverError::Closed),
        }
    }

    // ========================================================================
    // Bind / Connect / Send
    // ========================================================================

    /// Check a local endpoint. The modem picks local ports itself, so nothing
    /// is sent.
    pub fn bind(&self, id: SocketId, local: &Endpoint) -> DriverResult<()> {
        if !local.is_supported_family() {
            return Err(DriverError::AddressFamilyUnsupported);
        }
        self.ensure_open(id)
    }

    /// Set the remote endpoint of a socket.
    pub fn connect(&self, id: SocketId, remote: &Endpoint) -> DriverResult<()> {
        if !remote.is_supported_family() {
            return Err(DriverError::AddressFamilyUnsupported);
        }
        let addr = remote
            .ipv4()
            .ok_or_else(|| DriverError::InvalidArgument(format!("{} is not IPv4-mapped", remote)))?;
        if remote.port == 0 {
            return Err(DriverError::InvalidArgument("port 0".to_string()));
        }
        self.ensure_open(id)?;

        self.channel.with_channel(|ex| {
            ex.exec(&Command::SocketConnect {
                socket: id.modem_id(),
                port: remote.port,
                addr,
            })
        })?;
        debug!("SocketTable[{}]: socket {} connected to {}", self.modem(), id, remote);
        Ok(())
    }

    /// Send one datagram. Payloads above the configured maximum are truncated;
    /// the returned count is what the modem accepted.
    pub fn send(&self, id: SocketId, data: &[u8]) -> DriverResult<usize> {
        self.ensure_open(id)?;
        if data.is_empty() {
            return Ok(0);
        }

        let len = data.len().min(self.max_send_len);
        if len < data.len() {
            debug!(
                "SocketTable[{}]: truncating {} byte send to {} on socket {}",
                self.modem(),
                data.len(),
                len,
                id
            );
        }

        self.channel.with_channel(|ex| {
            ex.exec(&Command::SocketSend {
                socket: id.modem_id(),
                data: data[..len].to_vec(),
            })
        })?;

        let modem = self.modem().to_string();
        metrics::counter!(metric_defs::DATAGRAMS_SENT.name, "modem" => modem.clone()).increment(1);
        metrics::counter!(metric_defs::BYTES_SENT.name, "modem" => modem).increment(len as u64);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockModem, MockReply};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table_with_mock() -> (SocketTable, crate::mock::MockHandle) {
        let (modem, handle) = MockModem::new();
        let channel = Arc::new(Channel::new("test", Box::new(modem)));
        (SocketTable::new(channel, &DriverConfig::default()), handle)
    }

    fn noop() -> ReceiveCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_open_assigns_modem_id() {
        let (table, modem) = table_with_mock();
        let a = table.open(noop()).unwrap();
        let b = table.open(noop()).unwrap();

        assert_eq!(a.modem_id(), 0);
        assert_eq!(b.modem_id(), 1);
        assert_eq!(table.open_count(), 2);
        assert_eq!(modem.count("AT+CSOC="), 2);
    }

    #[test]
    fn test_open_modem_error_is_unavailable() {
        let (table, modem) = table_with_mock();
        modem.push("AT+CSOC=", MockReply::Error);

        assert!(matches!(table.open(noop()), Err(DriverError::Unavailable(_))));
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_open_out_of_range_id_is_released() {
        let (table, modem) = table_with_mock();
        modem.push("AT+CSOC=", MockReply::Info("+CSOC: 7".to_string()));

        assert!(matches!(table.open(noop()), Err(DriverError::OutOfSockets)));
        assert_eq!(modem.count("AT+CSOCL=7"), 1);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_open_id_beyond_u8_in_large_table() {
        let (modem, handle) = MockModem::new();
        let channel = Arc::new(Channel::new("test", Box::new(modem)));
        let config = DriverConfig {
            max_sockets: 300,
            ..DriverConfig::default()
        };
        let table = SocketTable::new(channel, &config);
        let first = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&first);
        table
            .open(Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        handle.push("AT+CSOC=", MockReply::Info("+CSOC: 256".to_string()));

        assert!(matches!(table.open(noop()), Err(DriverError::OutOfSockets)));
        // Slot 0 keeps its owner; 256 must not wrap onto it.
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(table.lookup(0).is_some());
        assert_eq!(table.open_count(), 1);
    }

    #[test]
    fn test_open_garbled_id_is_protocol_error() {
        let (table, modem) = table_with_mock();
        modem.push("AT+CSOC=", MockReply::Info("+CSOC: x".to_string()));

        assert!(matches!(table.open(noop()), Err(DriverError::Protocol(_))));
        assert_eq!(modem.drains(), 1);
    }

    #[test]
    fn test_reused_id_invalidates_previous_owner() {
        let (table, modem) = table_with_mock();
        let invalidated = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&invalidated);
        table
            .open(Arc::new(move |event| {
                if event == SlotEvent::Invalidated {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();

        modem.push("AT+CSOC=", MockReply::Info("+CSOC: 0".to_string()));
        let id = table.open(noop()).unwrap();

        assert_eq!(id.modem_id(), 0);
        assert_eq!(invalidated.load(Ordering::SeqCst), 1);
        assert_eq!(table.open_count(), 1);
    }

    #[test]
    fn test_close_clears_callback_and_is_idempotent() {
        let (table, modem) = table_with_mock();
        let id = table.open(noop()).unwrap();

        table.close(id).unwrap();
        table.close(id).unwrap();

        assert!(table.lookup(0).is_none());
        assert_eq!(modem.count("AT+CSOCL="), 1);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_close_failure_still_frees_slot() {
        let (table, modem) = table_with_mock();
        let id = table.open(noop()).unwrap();
        modem.push("AT+CSOCL=", MockReply::Error);

        assert!(table.close(id).is_err());
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let (table, _modem) = table_with_mock();
        assert!(table.lookup(5).is_none());
        assert!(table.lookup(u32::MAX).is_none());
    }

    #[test]
    fn test_connect_validates_endpoint() {
        let (table, modem) = table_with_mock();
        let id = table.open(noop()).unwrap();

        let zero_port = Endpoint::from_ipv4(Ipv4Addr::new(192, 0, 2, 1), 0);
        assert!(matches!(table.connect(id, &zero_port), Err(DriverError::InvalidArgument(_))));

        let native_v6 = Endpoint::from("[2001:db8::1]:53".parse::<std::net::SocketAddr>().unwrap());
        assert!(matches!(table.connect(id, &native_v6), Err(DriverError::InvalidArgument(_))));

        let inet = Endpoint {
            family: crate::endpoint::AddressFamily::Inet,
            ..Endpoint::from_ipv4(Ipv4Addr::new(192, 0, 2, 1), 53)
        };
        assert!(matches!(table.connect(id, &inet), Err(DriverError::AddressFamilyUnsupported)));

        table
            .connect(id, &Endpoint::from_ipv4(Ipv4Addr::new(192, 0, 2, 1), 53))
            .unwrap();
        assert_eq!(modem.count("AT+CSOCON=0,53,192.0.2.1"), 1);
    }

    #[test]
    fn test_connect_modem_error_is_surfaced() {
        let (table, modem) = table_with_mock();
        let id = table.open(noop()).unwrap();
        modem.push("AT+CSOCON=", MockReply::Error);

        let result = table.connect(id, &Endpoint::from_ipv4(Ipv4Addr::new(192, 0, 2, 1), 53));
        assert!(matches!(result, Err(DriverError::Unavailable(_))));
    }

    #[test]
    fn test_bind_checks_family_only() {
        let (table, modem) = table_with_mock();
        let id = table.open(noop()).unwrap();
        let before = modem.commands().len();

        table.bind(id, &Endpoint::from_ipv4(Ipv4Addr::UNSPECIFIED, 4000)).unwrap();
        let inet = Endpoint {
            family: crate::endpoint::AddressFamily::Inet,
            addr: [0; 16],
            port: 4000,
        };
        assert!(matches!(table.bind(id, &inet), Err(DriverError::AddressFamilyUnsupported)));
        assert_eq!(modem.commands().len(), before);
    }

    #[test]
    fn test_send_truncates_to_max() {
        let (table, modem) = table_with_mock();
        let id = table.open(noop()).unwrap();

        let payload = vec![0xAA; 1000];
        assert_eq!(table.send(id, &payload).unwrap(), 768);

        let sent = modem.commands().into_iter().find(|c| c.starts_with("AT+CSOSEND=")).unwrap();
        assert!(sent.starts_with("AT+CSOSEND=0,1536,"));
    }

    #[test]
    fn test_send_on_closed_slot() {
        let (table, _modem) = table_with_mock();
        let id = table.open(noop()).unwrap();
        table.close(id).unwrap();

        assert!(matches!(table.send(id, b"x"), Err(DriverError::Closed)));
    }

    #[test]
    fn test_invalidate_all_notifies_owners() {
        let (table, _modem) = table_with_mock();
        let invalidated = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = Arc::clone(&invalidated);
            table
                .open(Arc::new(move |event| {
                    if event == SlotEvent::Invalidated {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }))
                .unwrap();
        }

        table.invalidate_all();
        assert_eq!(invalidated.load(Ordering::SeqCst), 3);
        assert_eq!(table.open_count(), 0);
    }
}
