//! Socket endpoints.
//!
//! Endpoints carry a family tag, 128 bits of address storage and a port. The
//! modem only speaks IPv4, so the only meaningful endpoints are IPv6 ones
//! holding an IPv4-mapped address (`::ffff:a.b.c.d`).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// Family accepted by bind and connect.
pub const SUPPORTED_FAMILY: AddressFamily = AddressFamily::Inet6;

/// A UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub family: AddressFamily,
    pub addr: [u8; 16],
    pub port: u16,
}

impl Endpoint {
    /// IPv4-mapped endpoint in the supported family.
    pub fn from_ipv4(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint {
            family: AddressFamily::Inet6,
            addr: addr.to_ipv6_mapped().octets(),
            port,
        }
    }

    /// The all-zero endpoint.
    pub fn unspecified() -> Self {
        Endpoint {
            family: AddressFamily::Inet6,
            addr: [0; 16],
            port: 0,
        }
    }

    /// The IPv4 address if this is an IPv4-mapped endpoint.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.family {
            AddressFamily::Inet6 => Ipv6Addr::from(self.addr).to_ipv4_mapped(),
            AddressFamily::Inet => None,
        }
    }

    pub fn is_supported_family(&self) -> bool {
        self.family == SUPPORTED_FAMILY
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::from_ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Endpoint {
                family: AddressFamily::Inet6,
                addr: v6.ip().octets(),
                port: v6.port(),
            },
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ipv4() {
            Some(v4) => write!(f, "{}:{}", v4, self.port),
            None => write!(f, "[{}]:{}", Ipv6Addr::from(self.addr), self.port),
        }
    }
}
