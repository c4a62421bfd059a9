//! Ownership of post-Upgrade sockets.
//!
//! After an HTTP response negotiates `Connection: upgrade`, the socket
//! leaves the request pipeline and lives here: the manager registers it
//! with the reactor and drives the injected protocol engine on every
//! readiness event until the engine reports it is done.

use std::io::{self, Error, ErrorKind};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use log::{debug, warn};

use crate::reactor::{Handler, Reactor, RequestContext};
use crate::server::Server;
use crate::socket::Socket;

/// The contract the manager drives a protocol engine through. The
/// engine owns all wire knowledge; the manager only schedules it.
pub trait ProtocolEngine: Send + Sync {
    /// Process one readiness unit. `false` means the protocol is done
    /// and the socket should be detached.
    fn once(&self) -> bool;

    fn terminated(&self) -> bool;

    fn terminate(&self);

    fn send(&self, message: &[u8], binary: bool) -> io::Result<()>;

    fn close(&self, code: u16, reason: &str);
}

/// An upgraded connection: the accepted socket plus its engine, with a
/// per-socket lock serializing engine entry.
pub struct UpgradedSocket {
    socket: Arc<Socket>,
    engine: Box<dyn ProtocolEngine>,
    lock: Mutex<()>,
}

impl UpgradedSocket {
    pub fn new(socket: Arc<Socket>, engine: Box<dyn ProtocolEngine>) -> UpgradedSocket {
        UpgradedSocket {
            socket,
            engine,
            lock: Mutex::new(()),
        }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn engine(&self) -> &dyn ProtocolEngine {
        self.engine.as_ref()
    }
}

/// Holds every upgraded socket in the process, keyed by fd.
///
/// Iterating operations snapshot the set under the mutex and call into
/// the engines with the mutex released, so one slow peer cannot block
/// attach/detach.
pub struct SocketManager {
    socks: Mutex<IndexMap<RawFd, Arc<UpgradedSocket>>>,
    closed: AtomicBool,
    this: Weak<SocketManager>,
}

impl SocketManager {
    pub fn new() -> Arc<SocketManager> {
        Arc::new_cyclic(|this| SocketManager {
            socks: Mutex::new(IndexMap::new()),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Takes ownership of an upgraded socket: readiness on its fd now
    /// dispatches to this manager.
    pub fn attach(&self, reactor: &Arc<Reactor>, ws: Arc<UpgradedSocket>) -> io::Result<()> {
        let handler = self
            .this
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::Other, "socket manager dropped"))?;

        let fd = ws.socket().fileno();
        self.socks.lock().unwrap().insert(fd, ws.clone());

        if let Err(err) = reactor.add_listener(handler, ws.socket().clone()) {
            self.socks.lock().unwrap().shift_remove(&fd);
            return Err(err);
        }
        Ok(())
    }

    pub fn detach(&self, reactor: &Reactor, ws: &UpgradedSocket) {
        reactor.del_listener(ws.socket());
        self.socks.lock().unwrap().shift_remove(&ws.socket().fileno());
    }

    /// Snapshot of the current socket set.
    pub fn sockets(&self) -> Vec<Arc<UpgradedSocket>> {
        self.socks.lock().unwrap().values().cloned().collect()
    }

    pub fn broadcast(&self, message: &[u8], binary: bool) {
        for ws in self.sockets() {
            if ws.engine().terminated() {
                continue;
            }
            if let Err(err) = ws.engine().send(message, binary) {
                debug!("broadcast to {} failed: {}", ws.socket(), err);
            }
        }
    }

    pub fn close_all(&self, code: u16, reason: &str) {
        for ws in self.sockets() {
            ws.engine().close(code, reason);
        }
    }
}

impl Handler for SocketManager {
    fn dispatch(&self, ctx: &mut RequestContext, socket: &Arc<Socket>) {
        let fd = socket.fileno();
        let ws = { self.socks.lock().unwrap().get(&fd).cloned() };

        let ws = match ws {
            Some(ws) => ws,
            None => {
                warn!("readiness on unmanaged socket {}", socket);
                ctx.reactor.del_listener(socket);
                return;
            }
        };

        let _entry = ws.lock.lock().unwrap();
        if ws.engine().terminated() {
            return;
        }
        if !ws.engine().once() {
            self.detach(&ctx.reactor, &ws);
            if !ws.engine().terminated() {
                ws.engine().terminate();
            }
        }
    }

    fn name(&self) -> &'static str {
        "SocketManager"
    }
}

impl Server for SocketManager {
    fn start(&self) -> io::Result<()> {
        Ok(())
    }

    fn server_close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_all(1001, "server is shutting down");
        }
    }
}
