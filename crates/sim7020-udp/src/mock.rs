//! Scripted in-memory modem.
//!
//! [`MockModem`] implements [`CommandTransport`] without a serial link.
//! Replies are matched by command prefix: one-shot replies first, in the
//! order they were pushed, then persistent ones, newest first, then built-in
//! defaults that emulate a registered modem with an active context and
//! socket id allocation for `AT+CSOC` / `AT+CSOCL`.
//!
//! Every transport call marks itself in flight; a call that starts while
//! another is still running is counted as an overlap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::TransportError;
use crate::transport::{CommandTransport, NotificationHandler};

/// Scripted reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// `OK` with no information line.
    Ok,
    /// One information line, then `OK`.
    Info(String),
    /// `ERROR`.
    Error,
    /// No answer within the command timeout.
    Timeout,
}

/// Socket ids the built-in `AT+CSOC` handler hands out.
pub const MOCK_SOCKET_LIMIT: usize = 5;

pub const MOCK_IMSI: &str = "240011234567890";
pub const MOCK_IMEI: &str = "866000012345678";
pub const MOCK_LOCAL_ADDRESS: &str = "10.20.30.40";

#[derive(Default)]
struct MockState {
    once: VecDeque<(String, MockReply)>,
    persistent: Vec<(String, MockReply)>,
    urcs: VecDeque<String>,
    log: Vec<String>,
    sockets: [bool; MOCK_SOCKET_LIMIT],
    latency: Duration,
    drains: usize,
}

struct MockShared {
    state: Mutex<MockState>,
    urc_ready: Condvar,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
}

/// Marks a transport call in flight.
struct InFlight<'a>(&'a MockShared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a MockShared) -> Self {
        if shared.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        InFlight(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The transport side, handed to the driver.
pub struct MockModem {
    shared: Arc<MockShared>,
    handlers: Vec<(String, NotificationHandler)>,
}

/// The test side, used to script the modem and inspect what it saw.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockModem {
    pub fn new() -> (MockModem, MockHandle) {
        let shared = Arc::new(MockShared {
            state: Mutex::new(MockState::default()),
            urc_ready: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
        });
        let modem = MockModem {
            shared: Arc::clone(&shared),
            handlers: Vec::new(),
        };
        (modem, MockHandle { shared })
    }

    fn route(&mut self, line: &str) -> bool {
        match self.handlers.iter_mut().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            Some((_, handler)) => {
                handler(line);
                true
            }
            None => false,
        }
    }

    /// Deliver queued notifications, as if they arrived mid-exchange.
    fn flush_urcs(&mut self) -> usize {
        let urcs: Vec<String> = self.shared.state.lock().urcs.drain(..).collect();
        urcs.iter().filter(|line| self.route(line)).count()
    }

    fn exchange(&mut self, command: &str, timeout: Duration) -> Result<Option<String>, TransportError> {
        let shared = Arc::clone(&self.shared);
        let _in_flight = InFlight::enter(&shared);

        let (reply, latency) = {
            let mut state = shared.state.lock();
            state.log.push(command.to_string());
            (resolve(&mut state, command), state.latency)
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        self.flush_urcs();

        match reply {
            MockReply::Ok => Ok(None),
            MockReply::Info(line) => Ok(Some(line)),
            MockReply::Error => Err(TransportError::Modem("ERROR".to_string())),
            MockReply::Timeout => Err(TransportError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        }
    }
}

fn resolve(state: &mut MockState, command: &str) -> MockReply {
    if let Some(pos) = state.once.iter().position(|(prefix, _)| command.starts_with(prefix.as_str())) {
        if let Some((_, reply)) = state.once.remove(pos) {
            return reply;
        }
    }
    if let Some((_, reply)) = state
        .persistent
        .iter()
        .rev()
        .find(|(prefix, _)| command.starts_with(prefix.as_str()))
    {
        return reply.clone();
    }
    builtin(state, command)
}

fn builtin(state: &mut MockState, command: &str) -> MockReply {
    if command.starts_with("AT+CSOC=") {
        return match state.sockets.iter().position(|used| !used) {
            Some(id) => {
                state.sockets[id] = true;
                MockReply::Info(format!("+CSOC: {}", id))
            }
            None => MockReply::Error,
        };
    }
    if let Some(id) = command.strip_prefix("AT+CSOCL=") {
        if let Some(used) = id.parse::<usize>().ok().and_then(|id| state.sockets.get_mut(id)) {
            *used = false;
        }
        return MockReply::Ok;
    }

    match command {
        "AT+CREG?" => MockReply::Info("+CREG: 0,1".to_string()),
        "AT+CGACT?" => MockReply::Info("+CGACT: 1,1".to_string()),
        "AT+CIMI" => MockReply::Info(MOCK_IMSI.to_string()),
        "AT+GSN" => MockReply::Info(MOCK_IMEI.to_string()),
        "AT+CIFSR" => MockReply::Info(MOCK_LOCAL_ADDRESS.to_string()),
        "AT+CSTT?" => MockReply::Info("+CSTT: \"lpwa.telia.iot\",\"\",\"\"".to_string()),
        _ => MockReply::Ok,
    }
}

impl CommandTransport for MockModem {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<(), TransportError> {
        self.exchange(command, timeout).map(|_| ())
    }

    fn send_await_response(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.exchange(command, timeout)?
            .ok_or_else(|| TransportError::MissingResponse(command.to_string()))
    }

    fn register_notification(&mut self, prefix: &str, handler: NotificationHandler) {
        self.handlers.push((prefix.to_string(), handler));
    }

    fn dispatch_pending(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let shared = Arc::clone(&self.shared);
        let _in_flight = InFlight::enter(&shared);

        {
            let deadline = Instant::now() + timeout;
            let mut state = shared.state.lock();
            while state.urcs.is_empty() {
                if shared.urc_ready.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        Ok(self.flush_urcs())
    }

    fn drain(&mut self) {
        let mut state = self.shared.state.lock();
        state.drains += 1;
    }
}

impl MockHandle {
    /// Answer the next command starting with `prefix` with `reply`.
    pub fn push(&self, prefix: &str, reply: MockReply) {
        self.shared.state.lock().once.push_back((prefix.to_string(), reply));
    }

    /// Answer every command starting with `prefix` with `reply`.
    pub fn on(&self, prefix: &str, reply: MockReply) {
        self.shared.state.lock().persistent.push((prefix.to_string(), reply));
    }

    /// Queue an unsolicited line for the next transport call.
    pub fn inject_urc(&self, line: &str) {
        self.shared.state.lock().urcs.push_back(line.to_string());
        self.shared.urc_ready.notify_all();
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.state.lock().latency = latency;
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.shared.state.lock().log.clone()
    }

    /// Number of commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.shared
            .state
            .lock()
            .log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_log(&self) {
        self.shared.state.lock().log.clear();
    }

    /// Transport calls that started while another was in flight.
    pub fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }

    pub fn drains(&self) -> usize {
        self.shared.state.lock().drains
    }

    /// Socket ids currently allocated by the built-in `AT+CSOC` handler.
    pub fn open_socket_ids(&self) -> Vec<usize> {
        let state = self.shared.state.lock();
        (0..MOCK_SOCKET_LIMIT).filter(|&id| state.sockets[id]).collect()
    }
}
