//! Modem session state machine.
//!
//! ```text
//! Uninitialized --reset+config--> Idle --CREG 1|5--> Registered --CIICR--> Active
//!       ^                          ^                                        |
//!       | reset failed             +------ context lost / link down --------+
//! ```
//!
//! One background thread drives [`Session::run`]. Each handler blocks for as
//! long as its network interaction takes; only the individual polls are time
//! bounded.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sim7020_at::{Command, Response};
use sim7020_metrics::metric_defs;
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult, TransportError};
use crate::table::SocketTable;

// ============================================================================
// State
// ============================================================================

/// Session states, in bring-up order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Uninitialized,
    Idle,
    Registered,
    Active,
}

impl SessionState {
    /// Value reported on the session state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            SessionState::Uninitialized => 0.0,
            SessionState::Idle => 1.0,
            SessionState::Registered => 2.0,
            SessionState::Active => 3.0,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Idle => "idle",
            SessionState::Registered => "registered",
            SessionState::Active => "active",
        };
        f.write_str(name)
    }
}

/// Current session state, observable from other threads.
pub struct StateCell {
    state: Mutex<SessionState>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell {
            state: Mutex::new(SessionState::Uninitialized),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set(&self, state: SessionState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    /// Wait until the state equals `target`. Returns false on timeout.
    pub fn wait_for(&self, target: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != target {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return *state == target;
            }
        }
        true
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop request shared with the session thread. Sleeps end early once set.
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `duration`. Returns true if the stop signal was raised.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Drives one modem from reset to an active packet context and then keeps
/// notifications flowing.
pub struct Session {
    config: Arc<DriverConfig>,
    channel: Arc<Channel>,
    table: Arc<SocketTable>,
    state: Arc<StateCell>,
    stop: Arc<StopSignal>,
}

impl Session {
    pub fn new(
        config: Arc<DriverConfig>,
        channel: Arc<Channel>,
        table: Arc<SocketTable>,
        state: Arc<StateCell>,
        stop: Arc<StopSignal>,
    ) -> Self {
        Session {
            config,
            channel,
            table,
            state,
            stop,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Run the state machine until stopped or until device reset fails.
    pub fn run(&mut self) -> DriverResult<()> {
        info!("Session[{}]: starting", self.name());
        while !self.stop.is_triggered() {
            if let Err(e) = self.step() {
                error!("Session[{}]: bring-up aborted: {}", self.name(), e);
                return Err(e);
            }
        }
        info!("Session[{}]: stopped in state {}", self.name(), self.state());
        Ok(())
    }

    /// Run the handler of the current state once and record the result.
    pub fn step(&mut self) -> DriverResult<SessionState> {
        let current = self.state.get();
        let next = match current {
            SessionState::Uninitialized => self.initialize()?,
            SessionState::Idle => self.register(),
            SessionState::Registered => self.activate(),
            SessionState::Active => self.serve(),
        };

        if next != current {
            info!("Session[{}]: {} -> {}", self.name(), current, next);
            if current == SessionState::Active {
                self.table.invalidate_all();
            }
        }
        self.state.set(next);
        metrics::gauge!(metric_defs::SESSION_STATE.name, "modem" => self.name().to_string()).set(next.as_gauge());
        Ok(next)
    }

    // ========================================================================
    // Uninitialized -> Idle
    // ========================================================================

    fn initialize(&mut self) -> DriverResult<SessionState> {
        if let Err(e) = self.channel.with_channel(|ex| ex.exec(&Command::Reset)) {
            return Err(DriverError::ResetFailed(e.to_string()));
        }
        debug!("Session[{}]: module reset", self.name());

        let mut baseline = vec![Command::Attention, Command::DisablePowerSaving, Command::HexReceiveMode];
        if let Some(band) = self.config.band {
            baseline.push(Command::SetBand { band });
        }
        for command in &baseline {
            if let Err(e) = self.channel.with_channel(|ex| ex.exec(command)) {
                warn!("Session[{}]: {} failed, continuing: {}", self.name(), command.name(), e);
            }
        }

        for command in [Command::RequestImsi, Command::RequestImei] {
            match self.channel.with_channel(|ex| ex.query_text(&command)) {
                Ok(Some(value)) => info!("Session[{}]: {} {}", self.name(), command.name(), value),
                Ok(None) => debug!("Session[{}]: {} returned no value", self.name(), command.name()),
                Err(e) => warn!("Session[{}]: {} failed: {}", self.name(), command.name(), e),
            }
        }

        Ok(SessionState::Idle)
    }

    // ========================================================================
    // Idle -> Registered
    // ========================================================================

    /// Poll until registered. Retries forever; returns `Idle` only when stopped.
    fn register(&mut self) -> SessionState {
        let timing = &self.config.timing;
        let select = Command::SelectOperator {
            plmn: self.config.operator.clone(),
        };
        let mut polls: u32 = 0;

        loop {
            // A zero interval never reselects.
            if polls.checked_rem(timing.operator_reselect_polls) == Some(0) {
                debug!("Session[{}]: selecting operator {}", self.name(), self.config.operator);
                // The scan nudges the radio into a fresh network search.
                match self.channel.with_channel(|ex| ex.query_text(&Command::ListOperators)) {
                    Ok(Some(list)) => debug!("Session[{}]: operators {}", self.name(), list),
                    Ok(None) => {}
                    Err(e) => warn!("Session[{}]: operator scan failed: {}", self.name(), e),
                }
                if let Err(e) = self.channel.with_channel(|ex| ex.exec(&select)) {
                    warn!("Session[{}]: operator selection failed: {}", self.name(), e);
                }
            }

            polls = polls.wrapping_add(1);
            metrics::counter!(metric_defs::REGISTRATION_POLLS.name, "modem" => self.name().to_string()).increment(1);
            match self.channel.with_channel(|ex| ex.query(&Command::RegistrationStatus)) {
                Ok(Response::Registration { status, .. }) if status.is_registered() => {
                    info!("Session[{}]: registered ({:?}) after {} polls", self.name(), status, polls);
                    return SessionState::Registered;
                }
                Ok(Response::Registration { status, .. }) => {
                    trace!("Session[{}]: registration status {:?}", self.name(), status);
                }
                Ok(other) => debug!("Session[{}]: unexpected CREG reply {:?}", self.name(), other),
                Err(e) => warn!("Session[{}]: registration poll failed: {}", self.name(), e),
            }

            if self.stop.sleep(timing.registration_poll()) {
                return SessionState::Idle;
            }
        }
    }

    // ========================================================================
    // Registered -> Active
    // ========================================================================

    fn context_active(&self) -> DriverResult<bool> {
        match self.channel.with_channel(|ex| ex.query(&Command::ContextStatus))? {
            Response::ContextStatus { active, .. } => Ok(active),
            other => Err(DriverError::Protocol(format!("unexpected reply to AT+CGACT?: {:?}", other))),
        }
    }

    /// Bring up the packet context. Exhausting the attempt budget leaves the
    /// session `Registered`; the run loop calls this again.
    fn activate(&mut self) -> SessionState {
        match self.context_active() {
            Ok(true) => {
                info!("Session[{}]: packet context already active", self.name());
                self.log_local_address();
                return SessionState::Active;
            }
            Ok(false) => {}
            Err(e) => debug!("Session[{}]: context query failed: {}", self.name(), e),
        }

        let set_apn = Command::SetApn {
            apn: self.config.apn.clone(),
            user: self.config.apn_user.clone(),
            password: self.config.apn_password.clone(),
        };
        if let Err(e) = self.channel.with_channel(|ex| ex.exec(&set_apn)) {
            warn!("Session[{}]: setting APN {} failed: {}", self.name(), self.config.apn, e);
        }

        let timing = &self.config.timing;
        for attempt in 1..=timing.activation_attempts {
            metrics::counter!(metric_defs::ACTIVATION_ATTEMPTS.name, "modem" => self.name().to_string()).increment(1);
            match self.channel.with_channel(|ex| ex.exec(&Command::BringUpConnection)) {
                Ok(()) => {
                    info!("Session[{}]: packet context active (attempt {})", self.name(), attempt);
                    self.log_local_address();
                    return SessionState::Active;
                }
                Err(e) => warn!(
                    "Session[{}]: activation attempt {}/{} failed: {}",
                    self.name(),
                    attempt,
                    timing.activation_attempts,
                    e
                ),
            }
            if attempt < timing.activation_attempts && self.stop.sleep(timing.activation_retry()) {
                break;
            }
        }

        SessionState::Registered
    }

    fn log_local_address(&self) {
        match self.channel.with_channel(|ex| ex.query_text(&Command::LocalAddress)) {
            Ok(Some(addr)) => info!("Session[{}]: local address {}", self.name(), addr),
            Ok(None) => {}
            Err(e) => debug!("Session[{}]: local address query failed: {}", self.name(), e),
        }
    }

    // ========================================================================
    // Active
    // ========================================================================

    /// Dispatch notifications until the context is lost or the link drops.
    fn serve(&mut self) -> SessionState {
        let timing = &self.config.timing;
        let mut last_check = Instant::now();

        while !self.stop.is_triggered() {
            match self.channel.dispatch_cycle(timing.urc_poll()) {
                Ok(_) => {}
                Err(TransportError::Disconnected) => {
                    warn!("Session[{}]: transport disconnected", self.name());
                    return SessionState::Idle;
                }
                Err(e) => debug!("Session[{}]: dispatch cycle failed: {}", self.name(), e),
            }

            if last_check.elapsed() >= timing.activity_check() {
                last_check = Instant::now();
                match self.context_active() {
                    Ok(true) => trace!("Session[{}]: context still active", self.name()),
                    Ok(false) => {
                        warn!("Session[{}]: packet context lost", self.name());
                        return SessionState::Idle;
                    }
                    Err(e) => debug!("Session[{}]: activity check failed: {}", self.name(), e),
                }
            }
        }

        SessionState::Active
    }
}
