use std::fmt;
use std::fs;
use std::io::{self, Error, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use libc::c_int;

use crate::addr::{Address, AddressKind};
use crate::sys;

/// A bound-and-listening stream socket for one address family.
///
/// `bind` and `activate` are idempotent, so a server can be started
/// more than once without error. With address reuse requested, `bind`
/// sets `SO_REUSEADDR` and unlinks a stale socket file at a filesystem
/// Unix path; abstract names never unlink. After `bind` the address is
/// rewritten from `getsockname`, which resolves port 0 to the real
/// port.
pub struct StreamSocket {
    sock: sys::Socket,
    address: Mutex<Address>,
    reuse_address: bool,
    backlog: c_int,
    bound: AtomicBool,
    activated: AtomicBool,
}

impl StreamSocket {
    pub fn new(address: Address, backlog: u32, reuse_address: bool) -> io::Result<StreamSocket> {
        let family = match crate::addr::address_kind(&address) {
            AddressKind::Inet4 => libc::AF_INET,
            AddressKind::Inet6 => libc::AF_INET6,
            AddressKind::Unix | AddressKind::UnixAbstract => libc::AF_UNIX,
            AddressKind::Pipe => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "named pipe addresses are not supported",
                ))
            }
        };

        Ok(StreamSocket {
            sock: sys::Socket::stream(family)?,
            address: Mutex::new(address),
            reuse_address,
            backlog: backlog as c_int,
            bound: AtomicBool::new(false),
            activated: AtomicBool::new(false),
        })
    }

    pub fn bind(&self) -> io::Result<()> {
        if self.bound.load(Ordering::Acquire) {
            return Ok(());
        }

        let address = self.local_address();

        if self.reuse_address {
            self.sock.set_reuse_address(true)?;
            if let Address::Unix { path } = &address {
                if Path::new(path).exists() {
                    fs::remove_file(path)?;
                }
            }
        }

        match &address {
            Address::Inet4 { host, port } => {
                self.sock.bind_inet(&resolve_inet(host, *port, false)?)?
            }
            Address::Inet6 { host, port } => {
                self.sock.bind_inet(&resolve_inet(host, *port, true)?)?
            }
            Address::Unix { path } => self.sock.bind_unix(path.as_bytes())?,
            Address::UnixAbstract { name } => {
                let mut path = Vec::with_capacity(name.len() + 1);
                path.push(0);
                path.extend_from_slice(name.as_bytes());
                self.sock.bind_unix(&path)?
            }
        }

        if let Ok(raw) = self.sock.local_addr() {
            *self.address.lock().unwrap() = Address::from_raw(raw);
        }
        self.bound.store(true, Ordering::Release);

        Ok(())
    }

    /// Starts listening. The listener goes non-blocking so a spurious
    /// readiness event cannot stall the dispatch thread in `accept`.
    pub fn activate(&self) -> io::Result<()> {
        if self.activated.load(Ordering::Acquire) {
            return Ok(());
        }

        self.sock.listen(self.backlog)?;
        self.sock.set_nonblocking(true)?;
        self.activated.store(true, Ordering::Release);

        Ok(())
    }

    pub fn accept(&self) -> io::Result<(AcceptedStreamSocket, Address)> {
        let (sock, raw_peer) = self.sock.accept()?;

        let local = sock
            .local_addr()
            .map(Address::from_raw)
            .unwrap_or_else(|_| self.local_address());

        // Unix clients are usually unnamed; report the endpoint they
        // reached instead, as `REMOTE_ADDR` expects a renderable value.
        let peer = match raw_peer.map(Address::from_raw) {
            Some(addr) if !addr.is_unnamed() => addr,
            _ => local.clone(),
        };

        let accepted = AcceptedStreamSocket { sock, local, peer };
        let client_address = accepted.remote_address().clone();

        Ok((accepted, client_address))
    }

    pub fn local_address(&self) -> Address {
        self.address.lock().unwrap().clone()
    }

    pub fn fileno(&self) -> RawFd {
        self.sock.fileno()
    }

    pub fn closed(&self) -> bool {
        self.sock.is_closed()
    }

    pub fn close(&self) -> io::Result<()> {
        self.sock.close()
    }
}

impl AsRawFd for StreamSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.fileno()
    }
}

impl fmt::Display for StreamSocket {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.local_address())
    }
}

/// A connected stream socket returned from `accept`.
///
/// I/O retries `EINTR` within the call; everything else propagates.
/// `Read`/`Write` are implemented for shared references so buffered
/// readers and writers can layer over one shared connection.
pub struct AcceptedStreamSocket {
    sock: sys::Socket,
    local: Address,
    peer: Address,
}

impl AcceptedStreamSocket {
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn remote_address(&self) -> &Address {
        &self.peer
    }

    pub fn fileno(&self) -> RawFd {
        self.sock.fileno()
    }

    pub fn closed(&self) -> bool {
        self.sock.is_closed()
    }

    pub fn close(&self) -> io::Result<()> {
        self.sock.close()
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    /// Reads until `buf` is full. A peer close mid-buffer reports
    /// `UnexpectedEof`.
    pub fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.sock.recv(&mut buf[read..])?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed during read",
                ));
            }
            read += n;
        }
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf)
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(dur)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.sock.shutdown(how)
    }
}

impl Read for AcceptedStreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl<'a> Read for &'a AcceptedStreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl Write for AcceptedStreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> Write for &'a AcceptedStreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for AcceptedStreamSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.fileno()
    }
}

impl fmt::Display for AcceptedStreamSocket {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.peer)
    }
}

/// The two socket shapes the reactor multiplexes. Handlers match on the
/// variant to tell an accept event from connection readiness.
pub enum Socket {
    Listening(StreamSocket),
    Accepted(AcceptedStreamSocket),
}

impl Socket {
    pub fn fileno(&self) -> RawFd {
        match self {
            Socket::Listening(sock) => sock.fileno(),
            Socket::Accepted(sock) => sock.fileno(),
        }
    }

    pub fn closed(&self) -> bool {
        match self {
            Socket::Listening(sock) => sock.closed(),
            Socket::Accepted(sock) => sock.closed(),
        }
    }

    pub fn close(&self) -> io::Result<()> {
        match self {
            Socket::Listening(sock) => sock.close(),
            Socket::Accepted(sock) => sock.close(),
        }
    }

    pub fn local_address(&self) -> Address {
        match self {
            Socket::Listening(sock) => sock.local_address(),
            Socket::Accepted(sock) => sock.local_address().clone(),
        }
    }

    pub fn as_listener(&self) -> Option<&StreamSocket> {
        match self {
            Socket::Listening(sock) => Some(sock),
            Socket::Accepted(_) => None,
        }
    }

    pub fn as_accepted(&self) -> Option<&AcceptedStreamSocket> {
        match self {
            Socket::Listening(_) => None,
            Socket::Accepted(sock) => Some(sock),
        }
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Socket::Listening(sock) => write!(fmt, "{}", sock),
            Socket::Accepted(sock) => write!(fmt, "{}", sock),
        }
    }
}

fn resolve_inet(host: &str, port: u16, v6: bool) -> io::Result<SocketAddr> {
    if host.is_empty() {
        return Ok(if v6 {
            SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port)
        } else {
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port)
        });
    }

    for addr in (host, port).to_socket_addrs()? {
        match addr {
            SocketAddr::V4(_) if !v6 => return Ok(addr),
            SocketAddr::V6(_) if v6 => return Ok(addr),
            _ => {}
        }
    }

    Err(Error::new(
        ErrorKind::AddrNotAvailable,
        format!("no matching address for {}:{}", host, port),
    ))
}
