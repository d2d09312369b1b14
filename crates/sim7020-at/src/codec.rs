//! Line-based codec for the AT command channel.
//!
//! Commands are terminated with carriage return (`\r`). The modem echoes each
//! command back before answering, then emits zero or more information lines
//! followed by a final result code (`OK` or `ERROR`). Unsolicited result codes
//! (URCs) can appear between any two lines.

use bytes::BytesMut;

use crate::error::{AtError, AtResult};

/// Maximum line length accepted before the buffer is considered overrun.
///
/// A `+CSONMI` notification carrying a full receive buffer (512 bytes, hex
/// encoded) plus its header fits comfortably.
pub const MAX_LINE_LENGTH: usize = 2048;

/// Bytes of a dropped line kept in [`AtError::BufferOverflow`].
const OVERFLOW_HEAD_LEN: usize = 32;

/// Command terminator expected by the modem.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// A codec for reading and writing AT lines.
///
/// This handles the line-based nature of the AT protocol:
/// - Accumulates received bytes until a complete line is found
/// - Filters the echo of the last command sent
/// - Skips the blank lines the modem puts around every response
#[derive(Debug, Default)]
pub struct AtCodec {
    /// Buffer for accumulating incoming data.
    buffer: BytesMut,
    /// Whether we're currently receiving echo characters.
    in_echo: bool,
    /// The last command sent (for echo filtering).
    last_command: Option<String>,
    /// Position in the last command for echo matching.
    echo_pos: usize,
    /// Dropping the rest of an overlong line, up to its terminator.
    discarding: bool,
}

impl AtCodec {
    /// Create a new AT codec.
    pub fn new() -> Self {
        AtCodec {
            buffer: BytesMut::with_capacity(MAX_LINE_LENGTH),
            in_echo: false,
            last_command: None,
            echo_pos: 0,
            discarding: false,
        }
    }

    /// Set the last command sent (used for echo filtering).
    pub fn set_last_command(&mut self, cmd: &str) {
        self.last_command = Some(cmd.to_string());
        self.echo_pos = 0;
        self.in_echo = true;
    }

    /// Clear the echo tracking state.
    pub fn clear_echo(&mut self) {
        self.last_command = None;
        self.echo_pos = 0;
        self.in_echo = false;
    }

    /// Add received data to the buffer, dropping the command echo.
    pub fn push(&mut self, data: &[u8]) {
        for &byte in data {
            if self.discarding {
                if byte == b'\r' || byte == b'\n' {
                    self.discarding = false;
                }
                continue;
            }
            if self.in_echo {
                if let Some(ref cmd) = self.last_command {
                    let cmd_bytes = cmd.as_bytes();
                    if self.echo_pos < cmd_bytes.len() && byte == cmd_bytes[self.echo_pos] {
                        self.echo_pos += 1;
                        continue;
                    }
                    if self.echo_pos == cmd_bytes.len() && byte == b'\r' {
                        self.echo_pos += 1;
                        continue;
                    }
                    if self.echo_pos == cmd_bytes.len() + 1 && byte == b'\n' {
                        self.in_echo = false;
                        continue;
                    }
                }
                // Not an echo character, stop echo mode
                self.in_echo = false;
                if let Some(ref cmd) = self.last_command {
                    // A partial echo match was really the start of another line.
                    if self.echo_pos > 0 && self.echo_pos < cmd.len() {
                        self.buffer.extend_from_slice(&cmd.as_bytes()[..self.echo_pos]);
                    }
                }
            }

            self.buffer.extend_from_slice(&[byte]);
        }
    }

    /// Add received data without echo filtering.
    pub fn push_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode a complete, non-empty line from the buffer.
    ///
    /// Returns `None` if more data is needed.
    pub fn decode_line(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|&b| b == b'\r' || b == b'\n')?;

            let line_data = self.buffer.split_to(end);
            while !self.buffer.is_empty() && (self.buffer[0] == b'\r' || self.buffer[0] == b'\n') {
                let _ = self.buffer.split_to(1);
            }

            let line = String::from_utf8_lossy(&line_data).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
    }

    /// Drop a line that has grown past [`MAX_LINE_LENGTH`] without a
    /// terminator.
    ///
    /// The buffered part is cleared and the rest of the line is skipped as it
    /// arrives, so its tail never surfaces as a line of its own.
    pub fn check_overrun(&mut self) -> AtResult<()> {
        if self.buffer.len() <= MAX_LINE_LENGTH || self.buffer.iter().any(|&b| b == b'\r' || b == b'\n') {
            return Ok(());
        }

        let actual = self.buffer.len();
        let head = String::from_utf8_lossy(&self.buffer[..OVERFLOW_HEAD_LEN]).to_string();
        self.buffer.clear();
        self.discarding = true;
        Err(AtError::BufferOverflow {
            max: MAX_LINE_LENGTH,
            actual,
            head,
        })
    }

    /// Whether the rest of an overlong line is still being skipped.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Encode a command for transmission.
    ///
    /// Appends the carriage return terminator.
    pub fn encode_command(cmd: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(cmd.len() + 1);
        buf.extend_from_slice(cmd.as_bytes());
        buf.push(COMMAND_TERMINATOR);
        buf
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.clear_echo();
    }
}
