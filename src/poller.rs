//! Readiness polling over a set of file descriptors.
//!
//! `Poller` reports read (or priority-read) readiness only; writes stay
//! blocking on the connection, which is handled off the reactor thread.
//! Backend selection prefers `epoll` > `poll` > `select`.

use std::io::{self, Error, ErrorKind};
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use libc::c_int;

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::sys::Epoll;

pub enum Poller {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(Epoll),
    Poll(PollBackend),
    Select(SelectBackend),
}

impl Poller {
    /// Returns the best backend available on this platform.
    pub fn new() -> io::Result<Poller> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Ok(epoll) = Epoll::new() {
                return Ok(Poller::Epoll(epoll));
            }
        }

        Ok(Poller::Poll(PollBackend::new()))
    }

    pub fn poll_backend() -> Poller {
        Poller::Poll(PollBackend::new())
    }

    pub fn select_backend() -> Poller {
        Poller::Select(SelectBackend::new())
    }

    /// Registering an fd twice is a no-op. Safe while another thread is
    /// inside `poll`; the change takes effect by the next cycle.
    pub fn register(&self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(epoll) => epoll.add(fd),
            Poller::Poll(backend) => backend.register(fd),
            Poller::Select(backend) => backend.register(fd),
        }
    }

    /// Unregistering an unknown or already-closed fd is a silent no-op.
    pub fn unregister(&self, fd: RawFd) {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(epoll) => {
                let _ = epoll.delete(fd);
            }
            Poller::Poll(backend) => backend.unregister(fd),
            Poller::Select(backend) => backend.unregister(fd),
        }
    }

    /// Blocks up to `interval` and fills `ready` with the readable fds.
    /// A signal-interrupted wait reports an empty set; with nothing
    /// registered the call sleeps for `interval` instead of spinning.
    pub fn poll(&self, ready: &mut Vec<RawFd>, interval: Duration) -> io::Result<usize> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(epoll) => epoll.wait(ready, interval),
            Poller::Poll(backend) => backend.poll(ready, interval),
            Poller::Select(backend) => backend.poll(ready, interval),
        }
    }

    pub fn release(&self) {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(epoll) => epoll.close(),
            Poller::Poll(backend) => backend.release(),
            Poller::Select(backend) => backend.release(),
        }
    }
}

pub struct PollBackend {
    fds: Mutex<Vec<RawFd>>,
}

impl PollBackend {
    pub fn new() -> PollBackend {
        PollBackend {
            fds: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, fd: RawFd) -> io::Result<()> {
        let mut fds = self.fds.lock().unwrap();
        if !fds.contains(&fd) {
            fds.push(fd);
        }
        Ok(())
    }

    fn unregister(&self, fd: RawFd) {
        self.fds.lock().unwrap().retain(|&other| other != fd);
    }

    fn poll(&self, ready: &mut Vec<RawFd>, interval: Duration) -> io::Result<usize> {
        ready.clear();

        let fds = self.fds.lock().unwrap().clone();
        if fds.is_empty() {
            thread::sleep(interval);
            return Ok(0);
        }

        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN | libc::POLLPRI,
                revents: 0,
            })
            .collect();

        let timeout = interval.as_millis().min(c_int::MAX as u128) as c_int;
        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
            return Ok(0);
        }

        for pollfd in &pollfds {
            if pollfd.revents & (libc::POLLIN | libc::POLLPRI | libc::POLLHUP | libc::POLLERR) != 0
            {
                ready.push(pollfd.fd);
            }
        }

        Ok(ready.len())
    }

    fn release(&self) {
        self.fds.lock().unwrap().clear();
    }
}

pub struct SelectBackend {
    fds: Mutex<Vec<RawFd>>,
}

impl SelectBackend {
    pub fn new() -> SelectBackend {
        SelectBackend {
            fds: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, fd: RawFd) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "fd does not fit in an fd_set",
            ));
        }
        let mut fds = self.fds.lock().unwrap();
        if !fds.contains(&fd) {
            fds.push(fd);
        }
        Ok(())
    }

    fn unregister(&self, fd: RawFd) {
        self.fds.lock().unwrap().retain(|&other| other != fd);
    }

    fn poll(&self, ready: &mut Vec<RawFd>, interval: Duration) -> io::Result<usize> {
        ready.clear();

        let fds = self.fds.lock().unwrap().clone();
        if fds.is_empty() {
            thread::sleep(interval);
            return Ok(0);
        }

        let mut set: libc::fd_set = unsafe { mem::zeroed() };
        let mut nfds = 0;
        for &fd in &fds {
            unsafe { libc::FD_SET(fd, &mut set) };
            nfds = nfds.max(fd + 1);
        }

        let mut timeout = libc::timeval {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_usec: (interval.subsec_nanos() / 1000) as libc::suseconds_t,
        };

        let ret = unsafe {
            libc::select(
                nfds,
                &mut set,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut timeout,
            )
        };
        if ret < 0 {
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
            return Ok(0);
        }

        for &fd in &fds {
            if unsafe { libc::FD_ISSET(fd, &set) } {
                ready.push(fd);
            }
        }

        Ok(ready.len())
    }

    fn release(&self) {
        self.fds.lock().unwrap().clear();
    }
}

/// Polls a single fd for read readiness, the shape the HTTP keep-alive
/// idle wait uses. `None` blocks indefinitely. Both a timeout and a
/// signal-interrupted wait report not-ready.
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout = timeout
        .map(|to| to.as_millis().min(c_int::MAX as u128) as c_int)
        .unwrap_or(-1);

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI,
        revents: 0,
    };

    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout) };
    if ret < 0 {
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
        return Ok(false);
    }

    Ok(ret > 0)
}
