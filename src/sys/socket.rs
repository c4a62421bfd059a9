use std::ffi::CStr;
use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::{c_int, c_void, sa_family_t, sockaddr, sockaddr_storage, socklen_t};

use super::cvt;

/// A kernel-reported socket name, before it is folded into a domain
/// `Address`. Unix names carry the raw `sun_path` bytes: a leading NUL
/// for abstract sockets, nothing at all for unnamed peers.
pub enum RawAddr {
    Inet(SocketAddr),
    Unix(Vec<u8>),
}

pub struct Socket {
    fd: RawFd,
    closed: AtomicBool,
}

impl Socket {
    pub fn stream(family: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;

        let socket = Socket {
            fd,
            closed: AtomicBool::new(false),
        };

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.setsockopt(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as c_int)?;

        Ok(socket)
    }

    pub fn fileno(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases the OS descriptor. Safe to call more than once; only the
    /// first call reaches the kernel.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        syscall!(close(self.fd)).map(drop)
    }

    fn setsockopt<T>(&self, level: c_int, name: c_int, value: T) -> io::Result<()> {
        let payload = &value as *const T as *const c_void;
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            payload,
            mem::size_of::<T>() as socklen_t
        ))?;
        Ok(())
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut nonblocking = nonblocking as c_int;
        syscall!(ioctl(self.fd, libc::FIONBIO, &mut nonblocking)).map(drop)
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        let timeout = match dur {
            Some(dur) => {
                if dur.as_secs() == 0 && dur.subsec_nanos() == 0 {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "cannot set a 0 duration timeout",
                    ));
                }
                let mut timeout = libc::timeval {
                    tv_sec: dur.as_secs() as libc::time_t,
                    tv_usec: (dur.subsec_nanos() / 1000) as libc::suseconds_t,
                };
                if timeout.tv_sec == 0 && timeout.tv_usec == 0 {
                    timeout.tv_usec = 1;
                }
                timeout
            }
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, timeout)
    }

    pub fn bind_inet(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = inet_addr(addr);
        syscall!(bind(self.fd, &storage as *const _ as *const sockaddr, len)).map(drop)
    }

    pub fn bind_unix(&self, path: &[u8]) -> io::Result<()> {
        let (addr, len) = unix_addr(path)?;
        syscall!(bind(self.fd, &addr as *const _ as *const sockaddr, len)).map(drop)
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.fd, backlog)).map(drop)
    }

    pub fn accept(&self) -> io::Result<(Socket, Option<RawAddr>)> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let fd = {
            let res = loop {
                match syscall!(accept4(
                    self.fd,
                    &mut storage as *mut _ as *mut sockaddr,
                    &mut len,
                    libc::SOCK_CLOEXEC
                )) {
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                    other => break other,
                };
            };
            res?
        };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let fd = {
            let res = loop {
                match syscall!(accept(
                    self.fd,
                    &mut storage as *mut _ as *mut sockaddr,
                    &mut len
                )) {
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                    other => break other,
                };
            };
            let fd = res?;
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            fd
        };

        let socket = Socket {
            fd,
            closed: AtomicBool::new(false),
        };
        let peer = raw_addr(&storage, len).ok();

        Ok((socket, peer))
    }

    pub fn local_addr(&self) -> io::Result<RawAddr> {
        self.sockname(|storage, len| unsafe { libc::getsockname(self.fd, storage, len) })
    }

    fn sockname<F>(&self, f: F) -> io::Result<RawAddr>
    where
        F: FnOnce(*mut sockaddr, *mut socklen_t) -> c_int,
    {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        cvt(f(&mut storage as *mut _ as *mut _, &mut len))?;
        raw_addr(&storage, len)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        loop {
            match syscall!(recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0)) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
                Ok(n) => return Ok(n as usize),
            }
        }
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = 0;

        loop {
            match syscall!(send(self.fd, buf.as_ptr() as *const c_void, buf.len(), flags)) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
                Ok(n) => return Ok(n as usize),
            }
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.fd, how)).map(drop)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::NotConnected, "socket is closed")
}

fn inet_addr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(_) => mem::size_of::<libc::sockaddr_in>(),
        SocketAddr::V6(_) => mem::size_of::<libc::sockaddr_in6>(),
    };

    match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
        }
    }

    (storage, len as socklen_t)
}

fn sun_path_offset() -> usize {
    let addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    let base = &addr as *const _ as usize;
    let path = &addr.sun_path as *const _ as usize;
    path - base
}

fn unix_addr(path: &[u8]) -> io::Result<(libc::sockaddr_un, socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as sa_family_t;

    if path.len() >= addr.sun_path.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(path) {
        *dst = *src as libc::c_char;
    }

    // Pathname sockets carry a terminating NUL inside the reported
    // length; abstract names are sized exactly.
    let mut len = sun_path_offset() + path.len();
    if !path.is_empty() && path[0] != 0 {
        len += 1;
    }

    Ok((addr, len as socklen_t))
}

fn raw_addr(storage: &sockaddr_storage, len: socklen_t) -> io::Result<RawAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(RawAddr::Inet(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            ))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(RawAddr::Inet(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))))
        }
        libc::AF_UNIX => {
            let un = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
            let offset = sun_path_offset();
            let n = (len as usize)
                .saturating_sub(offset)
                .min(un.sun_path.len());
            let mut bytes: Vec<u8> = un.sun_path[..n].iter().map(|&c| c as u8).collect();
            if bytes.first() != Some(&0) {
                while bytes.last() == Some(&0) {
                    bytes.pop();
                }
            }
            Ok(RawAddr::Unix(bytes))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid argument")),
    }
}

/// Reverse name lookup for an IP address. `None` when the address does
/// not resolve; the caller keeps the numeric form.
pub fn name_lookup(ip: &IpAddr) -> Option<String> {
    let (storage, len) = inet_addr(&SocketAddr::new(*ip, 0));
    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];

    let res = unsafe {
        libc::getnameinfo(
            &storage as *const _ as *const sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if res != 0 {
        return None;
    }

    unsafe { CStr::from_ptr(host.as_ptr()) }
        .to_str()
        .ok()
        .map(str::to_string)
}
