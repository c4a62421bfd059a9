//! HTTP/1.1 keep-alive server on top of the reactor.
//!
//! The server accepts on the dispatch thread and hands each connection
//! to an [`Executor`] worker, where the whole keep-alive lifetime of
//! the connection runs. Applications implement [`App`] (any
//! `Fn(&Environ) -> Result<Response, AppError>` closure qualifies) and
//! the connection machinery takes care of framing: explicit
//! `Content-Length` responses stream as-is, in-memory bodies get a
//! computed length, streaming bodies go out chunked.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use log::error;

use crate::addr::Address;
use crate::executor::{Executor, ThreadPerConnection};
use crate::reactor::{Handler, RequestContext};
use crate::server::Server;
use crate::socket::{Socket, StreamSocket};
use crate::websocket::{ProtocolEngine, SocketManager};

mod environ;
mod handler;

pub use environ::Environ;

pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// The application callable: one request environment in, one response
/// out. Errors are caught by the connection handler, which logs them
/// and attempts a `500`.
pub trait App: Send + Sync {
    fn call(&self, environ: &Environ) -> Result<Response, AppError>;
}

impl<F> App for F
where
    F: Fn(&Environ) -> Result<Response, AppError> + Send + Sync,
{
    fn call(&self, environ: &Environ) -> Result<Response, AppError> {
        self(environ)
    }
}

/// Response body shapes, which drive the encoding policy: `Bytes`
/// buffers and gets a `Content-Length`; `Stream` is a producer of
/// unknown total size and goes out chunked on HTTP/1.1.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn Iterator<Item = Vec<u8>> + Send>),
}

pub type UpgradeFactory = Box<dyn FnOnce(Arc<Socket>) -> Box<dyn ProtocolEngine> + Send>;

/// A status string (`"200 OK"`), a header list, a body, and optionally
/// the protocol engine a negotiated Upgrade hands the socket to.
pub struct Response {
    pub(crate) status: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Body,
    pub(crate) upgrade: Option<UpgradeFactory>,
}

impl Response {
    pub fn new(status: impl Into<String>) -> Response {
        Response {
            status: status.into(),
            headers: Vec::new(),
            body: Body::Empty,
            upgrade: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bytes(mut self, body: impl Into<Vec<u8>>) -> Response {
        self.body = Body::Bytes(body.into());
        self
    }

    pub fn stream<I>(mut self, iter: I) -> Response
    where
        I: Iterator<Item = Vec<u8>> + Send + 'static,
    {
        self.body = Body::Stream(Box::new(iter));
        self
    }

    /// Attaches the engine factory run when this response negotiates
    /// `Connection: upgrade`; the factory receives the accepted socket.
    pub fn upgrade(mut self, factory: UpgradeFactory) -> Response {
        self.upgrade = Some(factory);
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
            .split(' ')
            .next()
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    pub(crate) fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn set_header(&mut self, name: &str, value: String) {
        self.headers.push((name.to_string(), value));
    }
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Idle wait between keep-alive requests; zero waits forever.
    pub keepalive_timeout: Duration,
    /// `SO_RCVTIMEO` applied to accepted connections.
    pub read_timeout: Option<Duration>,
    /// Reverse-resolve IPv6 peers for `REMOTE_HOST`.
    pub resolve_ipv6_address: bool,
    /// Reverse-resolve link-local IPv6 peers (`%`-scoped).
    pub resolve_ipv6_link_local_address: bool,
    /// Copy the request's `Connection` header into the response when
    /// the application did not set one (hop-by-hop filtering off).
    pub pass_connection_headers: bool,
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig {
            keepalive_timeout: Duration::from_secs(60),
            read_timeout: None,
            resolve_ipv6_address: true,
            resolve_ipv6_link_local_address: false,
            pass_connection_headers: true,
        }
    }
}

const REQUEST_QUEUE_SIZE: u32 = 5;

/// One listening endpoint serving `app`.
pub struct HttpServer {
    socket: Arc<Socket>,
    app: Arc<dyn App>,
    config: HttpConfig,
    executor: Arc<dyn Executor>,
    manager: Option<Arc<SocketManager>>,
}

impl HttpServer {
    pub fn new(address: Address, app: Arc<dyn App>) -> io::Result<HttpServer> {
        let listener = StreamSocket::new(address, REQUEST_QUEUE_SIZE, true)?;

        Ok(HttpServer {
            socket: Arc::new(Socket::Listening(listener)),
            app,
            config: HttpConfig::default(),
            executor: Arc::new(ThreadPerConnection),
            manager: None,
        })
    }

    pub fn with_config(mut self, config: HttpConfig) -> HttpServer {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> HttpServer {
        self.executor = executor;
        self
    }

    /// Connections whose responses negotiate an Upgrade are attached to
    /// `manager` and leave the HTTP pipeline.
    pub fn with_manager(mut self, manager: Arc<SocketManager>) -> HttpServer {
        self.manager = Some(manager);
        self
    }

    /// The bound address; call after `start` to learn a port chosen by
    /// the kernel.
    pub fn local_address(&self) -> Address {
        self.socket.local_address()
    }
}

impl Handler for HttpServer {
    fn dispatch(&self, ctx: &mut RequestContext, socket: &Arc<Socket>) {
        let listener = match socket.as_listener() {
            Some(listener) => listener,
            None => return,
        };

        let (conn, _client_address) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err)
                if err.kind() == ErrorKind::WouldBlock
                    || err.kind() == ErrorKind::NotConnected =>
            {
                return
            }
            Err(err) => {
                error!("accept failed on {}: {}", listener, err);
                return;
            }
        };

        let conn = Arc::new(Socket::Accepted(conn));
        let app = self.app.clone();
        let config = self.config.clone();
        let manager = self.manager.clone();
        let reactor = ctx.reactor.clone();
        let server = ctx.server.clone();

        self.executor.execute(Box::new(move || {
            let mut ctx = RequestContext::new(reactor, server, conn.clone());
            handler::handle_connection(&app, &config, manager.as_ref(), &mut ctx, &conn);
            if ctx.close_connection {
                let _ = conn.close();
            }
        }));
    }

    fn listening(&self) -> Option<Arc<Socket>> {
        Some(self.socket.clone())
    }

    fn name(&self) -> &'static str {
        "HttpServer"
    }
}

impl Server for HttpServer {
    fn start(&self) -> io::Result<()> {
        if let Some(listener) = self.socket.as_listener() {
            listener.bind()?;
            listener.activate()?;
        }
        Ok(())
    }

    fn server_close(&self) {
        let _ = self.socket.close();
    }
}
