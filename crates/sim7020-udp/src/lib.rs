//! SIM7020 NB-IoT UDP Driver
//!
//! Turns a SIM7020 modem, controlled only through its AT command interface,
//! into a small multi-socket UDP transport that many threads can use at once.
//!
//! # Architecture
//!
//! - [`Channel`]: one lock around the [`CommandTransport`]; every command
//!   exchange and every notification dispatch cycle is a critical section
//! - [`Session`]: background state machine, reset → registration → packet
//!   context activation → notification dispatch
//! - [`SocketTable`]: maps modem socket ids to receive callbacks
//! - [`InboundDecoder`]: turns `+CSONMI` notifications into owned datagrams
//! - [`UdpSocket`]: blocking socket API with a bounded per-socket mailbox
//! - [`Driver`]: owns all of the above for one modem
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use sim7020_udp::{Driver, DriverConfig, Endpoint, LineTransport, SessionState, SocketFlags};
//!
//! let port = std::fs::OpenOptions::new().read(true).write(true).open("/dev/ttyUSB0")?;
//! let transport = LineTransport::new(port.try_clone()?, port)?;
//! let driver = Driver::start(DriverConfig::default(), Box::new(transport))?;
//! driver.wait_for_state(SessionState::Active, Duration::from_secs(600));
//!
//! let remote = Endpoint::from("192.0.2.10:1883".parse::<std::net::SocketAddr>()?);
//! let socket = driver.create_socket(None, Some(remote), SocketFlags::NONE)?;
//! socket.send(b"ping", None)?;
//! let mut buf = [0u8; 512];
//! let (n, _from) = socket.recv(&mut buf, Some(Duration::from_secs(30)))?;
//! ```

mod channel;
mod config;
mod decoder;
mod driver;
mod endpoint;
mod error;
mod line_transport;
pub mod mock;
mod session;
mod socket;
mod table;
mod transport;

pub use channel::{Channel, Exchange};
pub use config::{load_config, load_config_from_str, DriverConfig, TimingConfig};
pub use decoder::{Disposition, InboundDecoder};
pub use driver::{Driver, ModemStatus};
pub use endpoint::{AddressFamily, Endpoint, SUPPORTED_FAMILY};
pub use error::{DriverError, DriverResult, TransportError};
pub use line_transport::LineTransport;
pub use session::{Session, SessionState, StateCell, StopSignal};
pub use socket::{SocketFlags, UdpSocket};
pub use table::{ReceiveCallback, SlotEvent, SocketId, SocketTable};
pub use transport::{CommandTransport, NotificationHandler};
