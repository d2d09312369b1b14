//! Driver facade.
//!
//! A [`Driver`] owns everything that belongs to one modem: the command
//! channel, the socket table, the session state and the background session
//! thread. Several drivers can coexist, each with its own transport.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sim7020_at::{Command, RegistrationStatus, Response, SOCKET_DATA_PREFIX};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::DriverConfig;
use crate::decoder::InboundDecoder;
use crate::endpoint::Endpoint;
use crate::error::{DriverError, DriverResult};
use crate::session::{Session, SessionState, StateCell, StopSignal};
use crate::socket::{SocketFlags, UdpSocket};
use crate::table::SocketTable;
use crate::transport::CommandTransport;

/// Snapshot of modem identity and network status. Fields the modem did not
/// answer are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModemStatus {
    pub registration: Option<RegistrationStatus>,
    pub imsi: Option<String>,
    pub imei: Option<String>,
    pub apn: Option<String>,
    pub local_address: Option<String>,
    /// Raw `+CENG` report.
    pub engineering: Option<String>,
}

/// A SIM7020 modem driven as a multi-socket UDP transport.
pub struct Driver {
    config: Arc<DriverConfig>,
    channel: Arc<Channel>,
    table: Arc<SocketTable>,
    state: Arc<StateCell>,
    stop: Arc<StopSignal>,
    session_thread: Mutex<Option<JoinHandle<DriverResult<()>>>>,
}

impl Driver {
    /// Build a driver on `transport` without starting the session thread.
    pub fn new(config: DriverConfig, transport: Box<dyn CommandTransport>) -> DriverResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let channel = Arc::new(Channel::new(config.name.clone(), transport));
        let table = Arc::new(SocketTable::new(Arc::clone(&channel), &config));

        let decoder = InboundDecoder::new(Arc::clone(&table), &config);
        channel.register_notification(SOCKET_DATA_PREFIX, decoder.into_handler());

        Ok(Driver {
            config,
            channel,
            table,
            state: Arc::new(StateCell::new()),
            stop: Arc::new(StopSignal::new()),
            session_thread: Mutex::new(None),
        })
    }

    /// Build a driver and start its session thread.
    pub fn start(config: DriverConfig, transport: Box<dyn CommandTransport>) -> DriverResult<Self> {
        let driver = Driver::new(config, transport)?;
        driver.spawn_session()?;
        Ok(driver)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Start the background session thread. Only one may run per driver.
    pub fn spawn_session(&self) -> DriverResult<()> {
        let mut slot = self.session_thread.lock();
        if slot.is_some() {
            return Err(DriverError::InvalidArgument("session thread already running".to_string()));
        }

        let mut session = Session::new(
            Arc::clone(&self.config),
            Arc::clone(&self.channel),
            Arc::clone(&self.table),
            Arc::clone(&self.state),
            Arc::clone(&self.stop),
        );
        let handle = thread::Builder::new()
            .name(format!("{}-session", self.config.name))
            .spawn(move || session.run())?;
        *slot = Some(handle);
        debug!("Driver[{}]: session thread started", self.config.name);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Wait until the session reaches `target`. Returns false on timeout.
    pub fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        self.state.wait_for(target, timeout)
    }

    /// Run one notification dispatch cycle on the calling thread.
    pub fn dispatch_pending(&self, timeout: Duration) -> DriverResult<usize> {
        Ok(self.channel.dispatch_cycle(timeout)?)
    }

    /// Create a socket, optionally bound and connected.
    pub fn create_socket(
        &self,
        local: Option<Endpoint>,
        remote: Option<Endpoint>,
        flags: SocketFlags,
    ) -> DriverResult<UdpSocket> {
        UdpSocket::create(Arc::clone(&self.table), &self.config, local, remote, flags)
    }

    /// Number of sockets open on the modem.
    pub fn open_sockets(&self) -> usize {
        self.table.open_count()
    }

    /// Query identity and network status.
    pub fn status(&self) -> ModemStatus {
        let mut status = ModemStatus::default();

        match self.channel.with_channel(|ex| ex.query(&Command::RegistrationStatus)) {
            Ok(Response::Registration { status: reg, .. }) => status.registration = Some(reg),
            Ok(other) => debug!("Driver[{}]: unexpected CREG reply {:?}", self.config.name, other),
            Err(e) => debug!("Driver[{}]: registration query failed: {}", self.config.name, e),
        }
        match self.channel.with_channel(|ex| ex.query(&Command::QueryApn)) {
            Ok(Response::Apn { apn }) => status.apn = Some(apn),
            Ok(other) => debug!("Driver[{}]: unexpected CSTT reply {:?}", self.config.name, other),
            Err(e) => debug!("Driver[{}]: APN query failed: {}", self.config.name, e),
        }

        status.imsi = self.text_query(&Command::RequestImsi);
        status.imei = self.text_query(&Command::RequestImei);
        status.local_address = self.text_query(&Command::LocalAddress);

        if let Err(e) = self
            .channel
            .with_channel(|ex| ex.exec(&Command::EngineeringMode { mode: 0 }))
        {
            debug!("Driver[{}]: engineering mode failed: {}", self.config.name, e);
        }
        status.engineering = self.text_query(&Command::EngineeringReport);

        status
    }

    fn text_query(&self, command: &Command) -> Option<String> {
        match self.channel.with_channel(|ex| ex.query_text(command)) {
            Ok(value) => value,
            Err(e) => {
                debug!("Driver[{}]: {} failed: {}", self.config.name, command.name(), e);
                None
            }
        }
    }

    /// Send a raw command and return its first information line.
    pub fn passthrough(&self, command: &str) -> DriverResult<Option<String>> {
        let command = Command::Raw {
            command: command.to_string(),
        };
        self.channel.with_channel(|ex| ex.query_text(&command))
    }

    /// Stop the session thread and close every socket.
    ///
    /// Returns the error that ended the session, if any. A command in flight
    /// runs to its own timeout before the thread can exit.
    pub fn shutdown(&self) -> DriverResult<()> {
        self.stop.trigger();
        let handle = self.session_thread.lock().take();

        let result = match handle {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(DriverError::Unavailable("session thread panicked".to_string())),
            },
            None => Ok(()),
        };

        self.table.invalidate_all();
        info!("Driver[{}]: shut down", self.config.name);
        result
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop.trigger();
        if self.session_thread.lock().is_some() {
            warn!("Driver[{}]: dropped without shutdown", self.config.name);
        }
    }
}
