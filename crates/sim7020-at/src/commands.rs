//! Commands that can be sent to the SIM7020 firmware.
//!
//! The driver uses a small subset of the SIM7020 AT command set:
//! - Module control (reset, power saving, receive format)
//! - Network registration and packet context activation
//! - UDP socket management (`+CSOC*` family)
//! - Identity and status queries, passed through mostly unparsed

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::codec::AtCodec;

/// Socket type argument for `AT+CSOC`: datagram.
pub const SOCKET_TYPE_DGRAM: u8 = 2;

/// Address family argument for `AT+CSOC`: IPv4.
pub const SOCKET_DOMAIN_IPV4: u8 = 1;

/// Protocol argument for `AT+CSOC`: IP.
pub const SOCKET_PROTOCOL_IP: u8 = 1;

/// Commands that can be sent to the modem.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // ========== Module Control ==========
    /// Attention, checks the command channel is alive.
    Attention,

    /// Reset the module.
    Reset,

    /// Disable power saving mode (`AT+CPSMS=0`).
    DisablePowerSaving,

    /// Deliver socket data as hex strings (`AT+CSORCVFLAG=0`).
    HexReceiveMode,

    /// Lock the radio to a single band to speed up network search.
    SetBand {
        /// 3GPP band number.
        band: u8,
    },

    // ========== Identity ==========
    /// Request the International Mobile Subscriber Identity.
    RequestImsi,

    /// Request the product serial number (IMEI).
    RequestImei,

    // ========== Network Registration ==========
    /// List available network operators.
    ListOperators,

    /// Manually select the operator by numeric PLMN code.
    SelectOperator {
        /// Numeric operator code (e.g., "24001").
        plmn: String,
    },

    /// Query network registration status.
    RegistrationStatus,

    // ========== Packet Context ==========
    /// Start task and set the access point name.
    SetApn {
        /// Access point name.
        apn: String,
        /// User name (may be empty).
        user: String,
        /// Password (may be empty).
        password: String,
    },

    /// Query the configured access point name.
    QueryApn,

    /// Bring up the wireless connection.
    BringUpConnection,

    /// Query PDP context activation state.
    ContextStatus,

    /// Get the local IP address.
    LocalAddress,

    /// Set engineering mode reporting.
    EngineeringMode {
        /// Report mode (0 = serving and neighbour cell info).
        mode: u8,
    },

    /// Read the engineering mode report.
    EngineeringReport,

    // ========== Sockets ==========
    /// Create an IPv4 UDP socket.
    SocketCreate,

    /// Connect a socket to a remote endpoint.
    SocketConnect {
        /// Modem-assigned socket id.
        socket: u8,
        /// Remote port.
        port: u16,
        /// Remote IPv4 address.
        addr: Ipv4Addr,
    },

    /// Send data on a connected socket. The payload is hex encoded on the wire.
    SocketSend {
        /// Modem-assigned socket id.
        socket: u8,
        /// Raw payload bytes.
        data: Vec<u8>,
    },

    /// Close a socket.
    SocketClose {
        /// Modem-assigned socket id.
        socket: u8,
    },

    // ========== Raw Command ==========
    /// Send a raw command string.
    Raw {
        /// The raw command text.
        command: String,
    },
}

impl Command {
    /// Encode the command as a line to send to the modem.
    /// Returns the bytes to send (including the `\r` terminator).
    pub fn encode(&self) -> Vec<u8> {
        let cmd_str = self.to_command_string();
        AtCodec::encode_command(&cmd_str)
    }

    /// Get the command string without the terminator.
    pub fn to_command_string(&self) -> String {
        match self {
            Command::Attention => "AT".to_string(),
            Command::Reset => "AT+RESET".to_string(),
            Command::DisablePowerSaving => "AT+CPSMS=0".to_string(),
            Command::HexReceiveMode => "AT+CSORCVFLAG=0".to_string(),
            Command::SetBand { band } => format!("AT+CBAND={}", band),

            Command::RequestImsi => "AT+CIMI".to_string(),
            Command::RequestImei => "AT+GSN".to_string(),

            Command::ListOperators => "AT+COPS=?".to_string(),
            Command::SelectOperator { plmn } => format!("AT+COPS=1,2,\"{}\"", plmn),
            Command::RegistrationStatus => "AT+CREG?".to_string(),

            Command::SetApn { apn, user, password } => {
                format!("AT+CSTT=\"{}\",\"{}\",\"{}\"", apn, user, password)
            }
            Command::QueryApn => "AT+CSTT?".to_string(),
            Command::BringUpConnection => "AT+CIICR".to_string(),
            Command::ContextStatus => "AT+CGACT?".to_string(),
            Command::LocalAddress => "AT+CIFSR".to_string(),
            Command::EngineeringMode { mode } => format!("AT+CENG={}", mode),
            Command::EngineeringReport => "AT+CENG?".to_string(),

            Command::SocketCreate => format!(
                "AT+CSOC={},{},{}",
                SOCKET_DOMAIN_IPV4, SOCKET_TYPE_DGRAM, SOCKET_PROTOCOL_IP
            ),
            Command::SocketConnect { socket, port, addr } => {
                format!("AT+CSOCON={},{},{}", socket, port, addr)
            }
            Command::SocketSend { socket, data } => {
                format!("AT+CSOSEND={},{},{}", socket, data.len() * 2, hex::encode(data))
            }
            Command::SocketClose { socket } => format!("AT+CSOCL={}", socket),

            Command::Raw { command } => command.clone(),
        }
    }

    /// Short name used for logging and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Attention => "at",
            Command::Reset => "reset",
            Command::DisablePowerSaving => "cpsms",
            Command::HexReceiveMode => "csorcvflag",
            Command::SetBand { .. } => "cband",
            Command::RequestImsi => "cimi",
            Command::RequestImei => "gsn",
            Command::ListOperators => "cops_list",
            Command::SelectOperator { .. } => "cops",
            Command::RegistrationStatus => "creg",
            Command::SetApn { .. } => "cstt",
            Command::QueryApn => "cstt_query",
            Command::BringUpConnection => "ciicr",
            Command::ContextStatus => "cgact",
            Command::LocalAddress => "cifsr",
            Command::EngineeringMode { .. } => "ceng",
            Command::EngineeringReport => "ceng_query",
            Command::SocketCreate => "csoc",
            Command::SocketConnect { .. } => "csocon",
            Command::SocketSend { .. } => "csosend",
            Command::SocketClose { .. } => "csocl",
            Command::Raw { .. } => "raw",
        }
    }

    /// How long the modem may take to produce a final result code.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Command::Attention
            | Command::Reset
            | Command::DisablePowerSaving
            | Command::HexReceiveMode
            | Command::SetBand { .. } => Duration::from_secs(5),
            Command::RequestImsi | Command::RequestImei => Duration::from_secs(10),
            Command::EngineeringMode { .. }
            | Command::EngineeringReport
            | Command::LocalAddress => Duration::from_secs(60),
            Command::BringUpConnection => Duration::from_secs(600),
            Command::ListOperators
            | Command::SelectOperator { .. }
            | Command::RegistrationStatus
            | Command::SetApn { .. }
            | Command::QueryApn
            | Command::ContextStatus
            | Command::SocketCreate
            | Command::SocketConnect { .. }
            | Command::SocketSend { .. }
            | Command::SocketClose { .. }
            | Command::Raw { .. } => Duration::from_secs(120),
        }
    }
}
