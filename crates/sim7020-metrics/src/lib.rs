//! Metrics for the SIM7020 UDP driver.
//!
//! Every metric the driver records is declared here as a [`Metric`] constant so
//! names cannot drift between the recording site and dashboards. The crate
//! re-exports `metrics`; without an installed recorder all calls are no-ops.
//!
//! # Example
//!
//! ```rust,ignore
//! use sim7020_metrics::{describe_metrics, metric_defs};
//!
//! describe_metrics();
//! metrics::counter!(metric_defs::COMMANDS_SENT.name, "modem" => "nbiot0", "command" => "csosend")
//!     .increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use sim7020_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const RETRIES: Metric = Metric::counter("sim7020.example.retries")
///     .with_description("Example retry counter")
///     .with_unit(Unit::Count)
///     .with_labels(&["modem"]);
///
/// assert_eq!(RETRIES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "sim7020.at.commands_sent").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a new counter metric.
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new gauge metric.
    pub const fn gauge(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new histogram metric.
    pub const fn histogram(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for the driver.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Label Keys
    // ========================================================================

    /// Label present on every metric: the configured modem name.
    pub const MODEM_LABELS: &[&str] = &["modem"];

    /// Labels for per-command metrics.
    pub const COMMAND_LABELS: &[&str] = &["modem", "command"];

    // ========================================================================
    // Command Channel
    // ========================================================================

    /// AT commands written to the modem.
    pub const COMMANDS_SENT: Metric = Metric::counter("sim7020.at.commands_sent")
        .with_description("AT commands written to the modem")
        .with_unit(Unit::Count)
        .with_labels(COMMAND_LABELS);

    /// AT commands that ended in ERROR, a timeout or an unexpected reply.
    ///
    /// Labels: modem, command, reason
    pub const COMMANDS_FAILED: Metric = Metric::counter("sim7020.at.commands_failed")
        .with_description("AT commands that did not complete with OK")
        .with_unit(Unit::Count)
        .with_labels(&["modem", "command", "reason"]);

    /// Time from writing a command to its final result code.
    pub const COMMAND_LATENCY: Metric = Metric::histogram("sim7020.at.command_latency_ms")
        .with_description("Time from command write to final result code")
        .with_unit(Unit::Milliseconds)
        .with_labels(COMMAND_LABELS);

    /// Channel drains after a desynchronised exchange.
    pub const CHANNEL_DRAINS: Metric = Metric::counter("sim7020.at.channel_drains")
        .with_description("Times the command channel was drained to resynchronise")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    // ========================================================================
    // Inbound Notifications
    // ========================================================================

    /// `+CSONMI` notifications handed to a socket.
    pub const URC_DELIVERED: Metric = Metric::counter("sim7020.urc.delivered")
        .with_description("Data notifications delivered to a socket")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    /// `+CSONMI` notifications dropped before reaching a socket.
    ///
    /// Labels: modem, reason (out_of_range | too_large | malformed | no_receiver)
    pub const URC_DISCARDED: Metric = Metric::counter("sim7020.urc.discarded")
        .with_description("Data notifications discarded by the decoder")
        .with_unit(Unit::Count)
        .with_labels(&["modem", "reason"]);

    // ========================================================================
    // Sockets
    // ========================================================================

    /// Datagrams sent.
    pub const DATAGRAMS_SENT: Metric = Metric::counter("sim7020.udp.datagrams_sent")
        .with_description("Datagrams accepted by the modem")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    /// Payload bytes sent.
    pub const BYTES_SENT: Metric = Metric::counter("sim7020.udp.bytes_sent")
        .with_description("Payload bytes accepted by the modem")
        .with_unit(Unit::Bytes)
        .with_labels(MODEM_LABELS);

    /// Datagrams received and queued in a mailbox.
    pub const DATAGRAMS_RECEIVED: Metric = Metric::counter("sim7020.udp.datagrams_received")
        .with_description("Datagrams queued for a receiver")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    /// Payload bytes received.
    pub const BYTES_RECEIVED: Metric = Metric::counter("sim7020.udp.bytes_received")
        .with_description("Payload bytes queued for a receiver")
        .with_unit(Unit::Bytes)
        .with_labels(MODEM_LABELS);

    /// Datagrams dropped because the socket mailbox was full.
    pub const MAILBOX_DROPS: Metric = Metric::counter("sim7020.udp.mailbox_drops")
        .with_description("Datagrams dropped on a full mailbox")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    /// Sockets currently open on the modem.
    pub const OPEN_SOCKETS: Metric = Metric::gauge("sim7020.udp.open_sockets")
        .with_description("Socket table slots in use")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    // ========================================================================
    // Session
    // ========================================================================

    /// Session state as a number (0 uninitialized, 1 idle, 2 registered, 3 active).
    pub const SESSION_STATE: Metric = Metric::gauge("sim7020.session.state")
        .with_description("Session state: 0 uninitialized, 1 idle, 2 registered, 3 active")
        .with_labels(MODEM_LABELS);

    /// Registration status polls.
    pub const REGISTRATION_POLLS: Metric = Metric::counter("sim7020.session.registration_polls")
        .with_description("AT+CREG? polls while waiting for registration")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    /// Packet context activation attempts.
    pub const ACTIVATION_ATTEMPTS: Metric = Metric::counter("sim7020.session.activation_attempts")
        .with_description("AT+CIICR attempts")
        .with_unit(Unit::Count)
        .with_labels(MODEM_LABELS);

    // ========================================================================
    // All Metrics
    // ========================================================================

    /// Every metric declared above.
    pub const ALL: &[&Metric] = &[
        &COMMANDS_SENT,
        &COMMANDS_FAILED,
        &COMMAND_LATENCY,
        &CHANNEL_DRAINS,
        &URC_DELIVERED,
        &URC_DISCARDED,
        &DATAGRAMS_SENT,
        &BYTES_SENT,
        &DATAGRAMS_RECEIVED,
        &BYTES_RECEIVED,
        &MAILBOX_DROPS,
        &OPEN_SOCKETS,
        &SESSION_STATE,
        &REGISTRATION_POLLS,
        &ACTIVATION_ATTEMPTS,
    ];
}

/// Describe all driver metrics. Call once after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
