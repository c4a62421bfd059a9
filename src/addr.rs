use std::fmt;
use std::io::{self, Error, ErrorKind};

use crate::sys::RawAddr;

/// A server endpoint across the address families the reactor speaks.
///
/// Inet addresses keep the configured host string until `bind` rewrites
/// them with the kernel-reported name (so port 0 resolves to the real
/// port). Abstract Unix names are stored without their leading NUL byte
/// and render with a leading `@`.
///
/// # Examples
///
/// ```
/// use multisock::Address;
///
/// let addr = Address::inet("::1", 8080);
/// assert_eq!(addr.to_string(), "::1:8080");
///
/// let addr = Address::from_path("\0control").unwrap();
/// assert_eq!(addr.to_string(), "@control");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Inet4 { host: String, port: u16 },
    Inet6 { host: String, port: u16 },
    Unix { path: String },
    UnixAbstract { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Inet4,
    Inet6,
    Unix,
    UnixAbstract,
    Pipe,
}

impl Address {
    /// Classifies `(host, port)` the way the config surface does: a
    /// host containing `:` is IPv6, anything else IPv4.
    pub fn inet(host: impl Into<String>, port: u16) -> Address {
        let host = host.into();
        if host.contains(':') {
            Address::Inet6 { host, port }
        } else {
            Address::Inet4 { host, port }
        }
    }

    /// Builds a Unix-domain address from a path. A leading NUL byte
    /// selects the abstract namespace. `\\`-prefixed paths are
    /// recognized as named pipes and rejected as unsupported.
    pub fn from_path(path: impl Into<String>) -> io::Result<Address> {
        let path = path.into();
        match AddressKind::of_path(&path) {
            AddressKind::UnixAbstract => Ok(Address::UnixAbstract {
                name: path[1..].to_string(),
            }),
            AddressKind::Unix => Ok(Address::Unix { path }),
            _ => Err(Error::new(
                ErrorKind::Unsupported,
                format!("named pipe address {:?} is not supported", path),
            )),
        }
    }

    /// The host part as it appears in `REMOTE_ADDR`/`SERVER_NAME`.
    pub fn host(&self) -> String {
        match self {
            Address::Inet4 { host, .. } | Address::Inet6 { host, .. } => host.clone(),
            Address::Unix { path } => path.clone(),
            Address::UnixAbstract { name } => format!("@{}", name),
        }
    }

    /// The port, or 0 for Unix-domain addresses.
    pub fn port(&self) -> u16 {
        match self {
            Address::Inet4 { port, .. } | Address::Inet6 { port, .. } => *port,
            Address::Unix { .. } | Address::UnixAbstract { .. } => 0,
        }
    }

    pub(crate) fn from_raw(raw: RawAddr) -> Address {
        match raw {
            RawAddr::Inet(std::net::SocketAddr::V4(a)) => Address::Inet4 {
                host: a.ip().to_string(),
                port: a.port(),
            },
            RawAddr::Inet(std::net::SocketAddr::V6(a)) => {
                let mut host = a.ip().to_string();
                if a.scope_id() != 0 {
                    host = format!("{}%{}", host, a.scope_id());
                }
                Address::Inet6 {
                    host,
                    port: a.port(),
                }
            }
            RawAddr::Unix(bytes) => {
                if bytes.first() == Some(&0) {
                    Address::UnixAbstract {
                        name: String::from_utf8_lossy(&bytes[1..]).into_owned(),
                    }
                } else {
                    Address::Unix {
                        path: String::from_utf8_lossy(&bytes).into_owned(),
                    }
                }
            }
        }
    }

    /// An unnamed Unix peer, reported by `accept` for most clients.
    pub(crate) fn is_unnamed(&self) -> bool {
        matches!(self, Address::Unix { path } if path.is_empty())
    }
}

/// Total classifier over constructed addresses; never reports `Pipe`.
pub fn address_kind(addr: &Address) -> AddressKind {
    match addr {
        Address::Inet4 { .. } => AddressKind::Inet4,
        Address::Inet6 { .. } => AddressKind::Inet6,
        Address::Unix { .. } => AddressKind::Unix,
        Address::UnixAbstract { .. } => AddressKind::UnixAbstract,
    }
}

impl AddressKind {
    /// Classifies a raw path string, including the named-pipe form that
    /// `Address` itself never represents.
    pub fn of_path(path: &str) -> AddressKind {
        if path.starts_with('\0') {
            AddressKind::UnixAbstract
        } else if path.starts_with("\\\\") {
            AddressKind::Pipe
        } else {
            AddressKind::Unix
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Inet4 { host, port } | Address::Inet6 { host, port } => {
                write!(fmt, "{}:{}", host, port)
            }
            Address::Unix { path } => write!(fmt, "{}", path),
            Address::UnixAbstract { name } => write!(fmt, "@{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inet_classification() {
        assert_eq!(
            address_kind(&Address::inet("127.0.0.1", 80)),
            AddressKind::Inet4
        );
        assert_eq!(address_kind(&Address::inet("::1", 80)), AddressKind::Inet6);
        assert_eq!(
            address_kind(&Address::inet("fe80::1%2", 80)),
            AddressKind::Inet6
        );
    }

    #[test]
    fn path_classification() {
        assert_eq!(
            address_kind(&Address::from_path("/tmp/sock").unwrap()),
            AddressKind::Unix
        );
        assert_eq!(
            address_kind(&Address::from_path("\0name").unwrap()),
            AddressKind::UnixAbstract
        );
        assert_eq!(AddressKind::of_path("\\\\.\\pipe\\x"), AddressKind::Pipe);
        assert!(Address::from_path("\\\\.\\pipe\\x").is_err());
    }

    #[test]
    fn abstract_renders_with_at() {
        let addr = Address::from_path("\0msock").unwrap();
        assert_eq!(addr.to_string(), "@msock");
        assert_eq!(addr.host(), "@msock");
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn inet_renders_host_port() {
        assert_eq!(Address::inet("127.0.0.1", 8080).to_string(), "127.0.0.1:8080");
    }
}
