//! Unsolicited result codes.
//!
//! With `AT+CSORCVFLAG=0` the modem announces every inbound datagram as
//!
//! ```text
//! +CSONMI: <socket>,<hex_len>,<hex_data>
//! ```
//!
//! where `<hex_len>` counts hex characters, two per payload byte.

use bytes::Bytes;

use crate::error::{AtError, AtResult};

/// Line prefix of the socket data notification.
pub const SOCKET_DATA_PREFIX: &str = "+CSONMI:";

/// Longest `+CSONMI` line the modem sends for a `payload_len` byte datagram,
/// with the largest socket id the driver can track.
pub fn socket_data_line_len(payload_len: usize) -> usize {
    let hex_len = payload_len.saturating_mul(2);
    format!("{} 255,{},", SOCKET_DATA_PREFIX, hex_len)
        .len()
        .saturating_add(hex_len)
}

/// A parsed `+CSONMI` notification. The payload is kept hex encoded until
/// [`SocketDataUrc::decode_payload`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketDataUrc {
    /// Modem-assigned socket id.
    pub socket: u32,
    /// Number of hex characters announced by the modem.
    pub hex_len: usize,
    /// Hex-encoded payload.
    pub data: String,
}

impl SocketDataUrc {
    /// Parse a notification line.
    pub fn parse(line: &str) -> AtResult<SocketDataUrc> {
        let rest = line
            .trim()
            .strip_prefix(SOCKET_DATA_PREFIX)
            .ok_or_else(|| AtError::ParseError(format!("not a {} line: {}", SOCKET_DATA_PREFIX, line)))?;

        let parts: Vec<&str> = rest.splitn(3, ',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(AtError::ParseError(format!(
                "expected 3 fields, got {}: {}",
                parts.len(),
                line
            )));
        }

        let socket: u32 = parts[0]
            .parse()
            .map_err(|_| AtError::ParseError(format!("invalid socket id: {}", parts[0])))?;
        let hex_len: usize = parts[1]
            .parse()
            .map_err(|_| AtError::ParseError(format!("invalid length: {}", parts[1])))?;
        let data = parts[2].to_string();

        if data.len() != hex_len {
            return Err(AtError::ParseError(format!(
                "length mismatch: announced {}, got {}",
                hex_len,
                data.len()
            )));
        }

        Ok(SocketDataUrc { socket, hex_len, data })
    }

    /// Decoded payload length in bytes. Odd hex lengths are rejected.
    pub fn payload_len(&self) -> AtResult<usize> {
        if self.hex_len % 2 != 0 {
            return Err(AtError::ParseError(format!("odd hex length {}", self.hex_len)));
        }
        Ok(self.hex_len / 2)
    }

    /// Decode the payload into an owned buffer.
    pub fn decode_payload(&self) -> AtResult<Bytes> {
        self.payload_len()?;
        let raw = hex::decode(&self.data)
            .map_err(|e| AtError::ParseError(format!("invalid hex payload: {}", e)))?;
        log::trace!("decoded {} byte payload for socket {}", raw.len(), self.socket);
        Ok(Bytes::from(raw))
    }
}
