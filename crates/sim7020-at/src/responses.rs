//! Response parsing for the AT protocol.
//!
//! Each line the modem emits while a command is outstanding is one of:
//! - A final result code: `OK`, `ERROR`, `+CME ERROR: <n>`, `+CMS ERROR: <n>`
//! - A prefixed information line: `+CREG: 0,1`, `+CSOC: 0`, `+CGACT: 1,1`
//! - A bare value: the IMSI, IMEI, or local IP address

use crate::error::{AtError, AtResult};

/// Network registration status reported by `+CREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not registered, not searching.
    NotRegistered,
    /// Registered on the home network.
    Home,
    /// Not registered, searching for an operator.
    Searching,
    /// Registration denied.
    Denied,
    /// Unknown (e.g., out of coverage).
    Unknown,
    /// Registered, roaming.
    Roaming,
    /// Any other status code.
    Other(u8),
}

impl RegistrationStatus {
    /// Map a numeric `<stat>` field to a status.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::Home,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::Denied,
            4 => RegistrationStatus::Unknown,
            5 => RegistrationStatus::Roaming,
            other => RegistrationStatus::Other(other),
        }
    }

    /// Whether the module is attached to a network (home or roaming).
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

/// Parsed response line from the modem.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Final `OK`.
    Ok,

    /// Final `ERROR`, `+CME ERROR: <n>` or `+CMS ERROR: <n>`.
    Error(String),

    /// `+CREG: [<n>,]<stat>[,...]`.
    Registration {
        /// Unsolicited report mode, if present.
        mode: Option<u8>,
        /// Registration status.
        status: RegistrationStatus,
    },

    /// `+CSOC: <id>` after socket creation.
    SocketCreated {
        /// Modem-assigned socket id.
        socket: u32,
    },

    /// `+CGACT: <cid>,<state>`.
    ContextStatus {
        /// PDP context id.
        cid: u8,
        /// Whether the context is active.
        active: bool,
    },

    /// `+CSTT: "<apn>",...`.
    Apn {
        /// Configured access point name.
        apn: String,
    },

    /// Any other information line, such as an IMSI or IP address.
    Value(String),

    /// A prefixed line this crate does not decode.
    Unknown(String),
}

impl Response {
    /// Parse a single response line.
    pub fn parse(text: &str) -> AtResult<Response> {
        let text = text.trim();

        if text == "OK" {
            return Ok(Response::Ok);
        }

        if is_final_line(text) && text != "OK" {
            return Ok(Response::Error(text.to_string()));
        }

        if let Some(rest) = text.strip_prefix("+CREG:") {
            return Self::parse_registration(rest);
        }

        if let Some(rest) = text.strip_prefix("+CSOC:") {
            let socket = rest
                .trim()
                .parse()
                .map_err(|_| AtError::ParseError(format!("invalid socket id: {}", text)))?;
            return Ok(Response::SocketCreated { socket });
        }

        if let Some(rest) = text.strip_prefix("+CGACT:") {
            return Self::parse_context(rest);
        }

        if let Some(rest) = text.strip_prefix("+CSTT:") {
            let apn = rest
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .trim_matches('"')
                .to_string();
            return Ok(Response::Apn { apn });
        }

        if text.starts_with('+') {
            return Ok(Response::Unknown(text.to_string()));
        }

        Ok(Response::Value(text.to_string()))
    }

    fn parse_registration(rest: &str) -> AtResult<Response> {
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        let parse = |s: &str| -> AtResult<u8> {
            s.parse()
                .map_err(|_| AtError::ParseError(format!("invalid +CREG field: {}", s)))
        };

        // Query form is "<n>,<stat>[,<lac>,<ci>]"; the URC form is "<stat>[,...]".
        let (mode, stat) = match fields.as_slice() {
            [stat] => (None, parse(stat)?),
            [n, stat, ..] => (Some(parse(n)?), parse(stat)?),
            [] => return Err(AtError::ParseError("empty +CREG".to_string())),
        };

        Ok(Response::Registration {
            mode,
            status: RegistrationStatus::from_code(stat),
        })
    }

    fn parse_context(rest: &str) -> AtResult<Response> {
        let mut fields = rest.split(',').map(str::trim);
        let cid = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AtError::ParseError(format!("invalid +CGACT: {}", rest)))?;
        let state: u8 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AtError::ParseError(format!("invalid +CGACT: {}", rest)))?;

        Ok(Response::ContextStatus {
            cid,
            active: state == 1,
        })
    }
}

/// Whether a raw line is a final result code.
pub fn is_final_line(line: &str) -> bool {
    let line = line.trim();
    line == "OK"
        || line == "ERROR"
        || line.starts_with("+CME ERROR")
        || line.starts_with("+CMS ERROR")
}
