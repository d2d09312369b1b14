//! SIM7020 AT Command Protocol
//!
//! Types and utilities for talking to a SIMCom SIM7020 NB-IoT module over its
//! serial AT command interface.
//!
//! # Protocol Overview
//!
//! - **Commands** (host → modem): `AT...` text terminated with `\r`
//! - **Responses** (modem → host): zero or more information lines followed by
//!   a final result code, `OK` or `ERROR`
//! - **Echo**: the modem echoes every command before answering
//! - **URCs**: unsolicited lines such as `+CSONMI: <id>,<len>,<hex>` may arrive
//!   at any time, including in the middle of a command exchange
//!
//! # Example
//!
//! ```rust,ignore
//! use sim7020_at::{Command, Response, SocketDataUrc};
//!
//! let line = Command::SocketCreate.encode();
//! let response = Response::parse("+CSOC: 0")?;
//! let urc = SocketDataUrc::parse("+CSONMI: 0,4,6869")?;
//! ```

mod codec;
mod commands;
mod error;
mod responses;
mod urc;

pub use codec::*;
pub use commands::*;
pub use error::*;
pub use responses::*;
pub use urc::*;
