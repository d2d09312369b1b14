//! Driver configuration.
//!
//! Loaded from YAML; every field has a default suitable for a Telia NB-IoT
//! subscription, so an empty document is a valid configuration.
//!
//! ```yaml
//! name: nbiot0
//! operator: "24001"
//! apn: lpwa.telia.iot
//! band: 20
//! timing:
//!   registration_poll_ms: 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sim7020_at::{socket_data_line_len, MAX_LINE_LENGTH};

use crate::error::{DriverError, DriverResult};

/// Session timing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between `AT+CREG?` polls.
    pub registration_poll_ms: u64,
    /// Reissue the operator selection every this many polls.
    pub operator_reselect_polls: u32,
    /// `AT+CIICR` attempts per activation pass.
    pub activation_attempts: u32,
    /// Pause between failed activation attempts.
    pub activation_retry_ms: u64,
    /// Length of one notification dispatch cycle.
    pub urc_poll_ms: u64,
    /// Interval between packet context checks while active.
    pub activity_check_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            registration_poll_ms: 5000,
            operator_reselect_polls: 8,
            activation_attempts: 3,
            activation_retry_ms: 8000,
            urc_poll_ms: 100,
            activity_check_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn registration_poll(&self) -> Duration {
        Duration::from_millis(self.registration_poll_ms)
    }

    pub fn activation_retry(&self) -> Duration {
        Duration::from_millis(self.activation_retry_ms)
    }

    pub fn urc_poll(&self) -> Duration {
        Duration::from_millis(self.urc_poll_ms)
    }

    pub fn activity_check(&self) -> Duration {
        Duration::from_millis(self.activity_check_ms)
    }
}

/// Configuration for one modem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name used in logs, metric labels and thread names.
    pub name: String,
    /// Numeric PLMN code of the operator to register with.
    pub operator: String,
    /// Access point name.
    pub apn: String,
    /// APN user name.
    pub apn_user: String,
    /// APN password.
    pub apn_password: String,
    /// Optional band lock applied during initialization.
    pub band: Option<u8>,
    /// Socket table size. The modem assigns ids below this bound.
    pub max_sockets: usize,
    /// Largest payload accepted by one send call.
    pub max_send_len: usize,
    /// Largest decoded payload accepted from the modem.
    pub max_recv_len: usize,
    /// Datagrams queued per socket before new ones are dropped.
    pub mailbox_capacity: usize,
    /// Session timing.
    pub timing: TimingConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            name: "sim7020".to_string(),
            operator: "24001".to_string(),
            apn: "lpwa.telia.iot".to_string(),
            apn_user: String::new(),
            apn_password: String::new(),
            band: None,
            max_sockets: 5,
            max_send_len: 768,
            max_recv_len: 512,
            mailbox_capacity: 2,
            timing: TimingConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Check the configuration for values the driver cannot work with.
    pub fn validate(&self) -> DriverResult<()> {
        if self.max_sockets == 0 || self.max_sockets > 255 {
            return Err(DriverError::Config(format!(
                "max_sockets must be between 1 and 255, got {}",
                self.max_sockets
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(DriverError::Config("mailbox_capacity must be at least 1".to_string()));
        }
        if self.max_send_len == 0 || self.max_recv_len == 0 {
            return Err(DriverError::Config("max_send_len and max_recv_len must be non-zero".to_string()));
        }
        if socket_data_line_len(self.max_recv_len) > MAX_LINE_LENGTH {
            return Err(DriverError::Config(format!(
                "max_recv_len {} does not fit a {} byte notification line",
                self.max_recv_len, MAX_LINE_LENGTH
            )));
        }
        if self.timing.operator_reselect_polls == 0 {
            return Err(DriverError::Config("operator_reselect_polls must be at least 1".to_string()));
        }
        if self.timing.activation_attempts == 0 {
            return Err(DriverError::Config("activation_attempts must be at least 1".to_string()));
        }
        if self.operator.is_empty() || !self.operator.chars().all(|c| c.is_ascii_digit()) {
            return Err(DriverError::Config(format!("operator must be a numeric PLMN, got '{}'", self.operator)));
        }
        Ok(())
    }
}

/// Parse a configuration from YAML text.
pub fn load_config_from_str(yaml: &str) -> DriverResult<DriverConfig> {
    let config: DriverConfig =
        serde_yaml::from_str(yaml).map_err(|e| DriverError::Config(format!("invalid YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> DriverResult<DriverConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| DriverError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    load_config_from_str(&text)
}
