use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::addr::Address;
use crate::http::{App, HttpServer};
use crate::logging::{ConfigApplier, LogConfigServer, LogServer, LogSink, LogWriter, StdLogSink};
use crate::reactor::{Handler, Reactor};

/// A reactor endpoint with a lifecycle: bind/activate at `start`,
/// release the listener at `server_close`.
pub trait Server: Handler {
    fn start(&self) -> io::Result<()>;

    fn server_close(&self);
}

/// Owns one reactor and the servers multiplexed through it, plus the
/// process-wide log writer every [`LogServer`] shares.
///
/// `shutdown` closes servers in reverse registration order and
/// deregisters them before stopping the reactor, so no accept can race
/// with teardown; in-flight HTTP work finishes on its worker threads.
pub struct MultiServer {
    reactor: Arc<Reactor>,
    servers: Mutex<Vec<Arc<dyn Server>>>,
    log_sink: Mutex<Arc<dyn LogSink>>,
    log_writer: Mutex<Option<LogWriter>>,
}

impl MultiServer {
    pub fn new() -> io::Result<MultiServer> {
        Ok(MultiServer::with_reactor(Arc::new(Reactor::new()?)))
    }

    pub fn with_reactor(reactor: Arc<Reactor>) -> MultiServer {
        MultiServer {
            reactor,
            servers: Mutex::new(Vec::new()),
            log_sink: Mutex::new(Arc::new(StdLogSink)),
            log_writer: Mutex::new(None),
        }
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Replaces the sink used by the log writer. Takes effect only
    /// before the first log server is added.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self.log_sink.lock().unwrap() = sink;
    }

    /// The process-wide writer, created on first use. One writer for
    /// every log endpoint keeps records ordered across them.
    pub fn log_writer(&self) -> LogWriter {
        let mut writer = self.log_writer.lock().unwrap();
        writer
            .get_or_insert_with(|| LogWriter::new(self.log_sink.lock().unwrap().clone()))
            .clone()
    }

    /// Starts `server` (idempotent bind + activate) and registers its
    /// listening socket with the reactor.
    pub fn add_server<S>(&self, server: Arc<S>) -> io::Result<()>
    where
        S: Server + 'static,
    {
        server.start()?;
        if let Some(socket) = server.listening() {
            self.reactor.add_listener(server.clone(), socket)?;
        }
        self.servers.lock().unwrap().push(server);
        Ok(())
    }

    pub fn http_server(&self, address: Address, app: Arc<dyn App>) -> io::Result<Arc<HttpServer>> {
        let server = Arc::new(HttpServer::new(address, app)?);
        self.add_server(server.clone())?;
        Ok(server)
    }

    pub fn log_server(
        &self,
        address: Address,
        log_name: Option<&str>,
    ) -> io::Result<Arc<LogServer>> {
        let mut server = LogServer::new(address, self.log_writer())?;
        if let Some(name) = log_name {
            server = server.with_log_name(name);
        }
        let server = Arc::new(server);
        self.add_server(server.clone())?;
        Ok(server)
    }

    pub fn log_config_server(
        &self,
        address: Address,
        applier: Arc<dyn ConfigApplier>,
        allow_remote_config: bool,
    ) -> io::Result<Arc<LogConfigServer>> {
        let server = Arc::new(LogConfigServer::new(address, applier, allow_remote_config)?);
        self.add_server(server.clone())?;
        Ok(server)
    }

    /// Runs the reactor loop on the calling thread until `shutdown`.
    pub fn run(&self, poll_interval: Duration) -> io::Result<()> {
        info!("Start serving");
        self.reactor.clone().run(poll_interval)
    }

    pub fn shutdown(&self) {
        info!("Server stopping");

        let servers: Vec<Arc<dyn Server>> = {
            let servers = self.servers.lock().unwrap();
            servers.iter().rev().cloned().collect()
        };
        for server in servers {
            server.server_close();
            if let Some(socket) = server.listening() {
                self.reactor.del_listener(&socket);
            }
        }

        self.reactor.shutdown();

        if let Some(writer) = self.log_writer.lock().unwrap().as_ref() {
            writer.shutdown();
        }
    }
}
