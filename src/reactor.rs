//! Single-threaded readiness dispatch over a shared registration map.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::info;

use crate::poller::Poller;
use crate::socket::Socket;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A protocol endpoint driven by the reactor.
///
/// `dispatch` runs on the dispatch thread when the registered socket is
/// ready; it must not block beyond the bounded reads the poller already
/// vouched for, and may hand longer work to an executor. Handlers may
/// register and deregister sockets from inside `dispatch`.
pub trait Handler: Send + Sync {
    fn dispatch(&self, ctx: &mut RequestContext, socket: &Arc<Socket>);

    /// The handler's default listening socket, used by
    /// [`Reactor::add_server`] and [`Reactor::del_server`].
    fn listening(&self) -> Option<Arc<Socket>> {
        None
    }

    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Per-dispatch context handed to [`Handler::dispatch`].
///
/// Worker threads that take over an accepted connection build their own
/// context, so parallel dispatches never share one. The accept wrapper
/// closes the accepted socket after handling unless the handler cleared
/// `close_connection` to transfer ownership to a long-lived manager.
pub struct RequestContext {
    pub reactor: Arc<Reactor>,
    pub server: Arc<dyn Handler>,
    pub socket: Arc<Socket>,
    pub close_connection: bool,
}

impl RequestContext {
    pub fn new(reactor: Arc<Reactor>, server: Arc<dyn Handler>, socket: Arc<Socket>) -> RequestContext {
        RequestContext {
            reactor,
            server,
            socket,
            close_connection: true,
        }
    }
}

type Registration = (Arc<dyn Handler>, Arc<Socket>);

/// Owns the poller and the fd → (handler, socket) map and drives the
/// dispatch loop.
///
/// An fd is present in the map iff it is registered with the poller;
/// both are mutated under one lock, which is never held across a
/// dispatch call. Registration is idempotent and removal is safe from
/// any thread, including from inside `dispatch`.
pub struct Reactor {
    registered: Mutex<IndexMap<RawFd, Registration>>,
    poller: Poller,
    shutdown_request: AtomicBool,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor::with_poller(Poller::new()?))
    }

    pub fn with_poller(poller: Poller) -> Reactor {
        Reactor {
            registered: Mutex::new(IndexMap::new()),
            poller,
            shutdown_request: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, handler: Arc<dyn Handler>, socket: Arc<Socket>) -> io::Result<()> {
        let fd = socket.fileno();
        let mut registered = self.registered.lock().unwrap();

        if registered.contains_key(&fd) {
            return Ok(());
        }

        self.poller.register(fd)?;
        match &*socket {
            Socket::Accepted(sock) => info!("Managing socket {}", sock),
            Socket::Listening(sock) => info!("Listen on {} for {}", sock, handler.name()),
        }
        registered.insert(fd, (handler, socket));

        Ok(())
    }

    /// Registers the handler's default listening socket.
    pub fn add_server(&self, handler: Arc<dyn Handler>) -> io::Result<()> {
        match handler.listening() {
            Some(socket) => self.add_listener(handler, socket),
            None => Ok(()),
        }
    }

    pub fn del_listener(&self, socket: &Socket) {
        let fd = socket.fileno();
        let mut registered = self.registered.lock().unwrap();

        if let Some((_, removed)) = registered.shift_remove(&fd) {
            self.poller.unregister(fd);
            match &*removed {
                Socket::Accepted(sock) => info!("Removing socket {}", sock),
                Socket::Listening(sock) => info!("Shutdown serving socket {}", sock),
            }
        }
    }

    pub fn del_server(&self, handler: &dyn Handler) {
        if let Some(socket) = handler.listening() {
            self.del_listener(&socket);
        }
    }

    /// Registered sockets, ordered by fd.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        let registered = self.registered.lock().unwrap();
        let mut sockets: Vec<Arc<Socket>> =
            registered.values().map(|(_, sock)| sock.clone()).collect();
        sockets.sort_by_key(|sock| sock.fileno());
        sockets
    }

    /// Distinct registered handlers.
    pub fn servers(&self) -> Vec<Arc<dyn Handler>> {
        let registered = self.registered.lock().unwrap();
        let mut servers: Vec<Arc<dyn Handler>> = Vec::new();
        for (handler, _) in registered.values() {
            if !servers
                .iter()
                .any(|known| Arc::ptr_eq(known, handler))
            {
                servers.push(handler.clone());
            }
        }
        servers
    }

    /// Runs the dispatch loop until [`shutdown`](Reactor::shutdown).
    ///
    /// Each ready fd is looked up in the registration map; an fd that
    /// lost its registration since the poll (a `del_*` race) is
    /// unregistered from the poller and skipped. Poll failures other
    /// than `EINTR` abort the loop with the error. Poller resources are
    /// released on the way out.
    pub fn run(self: Arc<Self>, poll_interval: Duration) -> io::Result<()> {
        self.shutdown_request.store(false, Ordering::SeqCst);
        let mut ready = Vec::with_capacity(64);

        let result = loop {
            if self.shutdown_request.load(Ordering::SeqCst) {
                break Ok(());
            }

            if let Err(err) = self.poller.poll(&mut ready, poll_interval) {
                break Err(err);
            }

            for &fd in &ready {
                let entry = {
                    let registered = self.registered.lock().unwrap();
                    registered
                        .get(&fd)
                        .map(|(handler, socket)| (handler.clone(), socket.clone()))
                };

                let (handler, socket) = match entry {
                    Some(entry) => entry,
                    None => {
                        self.poller.unregister(fd);
                        continue;
                    }
                };

                let mut ctx =
                    RequestContext::new(self.clone(), handler.clone(), socket.clone());
                handler.dispatch(&mut ctx, &socket);
            }
        };

        self.poller.release();
        result
    }

    /// Requests the loop to exit; observed at the top of the next poll
    /// cycle, so the loop ends within one poll interval.
    pub fn shutdown(&self) {
        self.shutdown_request.store(true, Ordering::SeqCst);
    }
}
