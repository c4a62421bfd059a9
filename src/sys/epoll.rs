use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::{c_int, EPOLLIN, EPOLLPRI};

const MAX_EVENTS: usize = 256;

pub struct Epoll {
    epfd: RawFd,
    closed: AtomicBool,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll {
            epfd,
            closed: AtomicBool::new(false),
        })
    }

    /// Watch `fd` for read readiness. Adding an fd twice is a no-op.
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: (EPOLLIN | EPOLLPRI) as u32,
            u64: fd as u64,
        };

        match syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info)) {
            Ok(_) => Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stop watching `fd`. Unknown or already-closed fds are ignored.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        match syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info)) {
            Ok(_) => Ok(()),
            Err(ref e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` and push the ready fds into `ready`. A wait
    /// interrupted by a signal reports no fds.
    pub fn wait(&self, ready: &mut Vec<RawFd>, timeout: Duration) -> io::Result<usize> {
        ready.clear();

        let timeout = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };

        let cnt = match syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            MAX_EVENTS as c_int,
            timeout
        )) {
            Ok(cnt) => cnt,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        };

        for event in events.iter().take(cnt as usize) {
            ready.push(event.u64 as RawFd);
        }

        Ok(ready.len())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                let _ = libc::close(self.epfd);
            }
        }
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        self.close();
    }
}
