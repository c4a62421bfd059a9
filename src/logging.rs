//! Length-prefixed log-record receiver.
//!
//! The wire format is a 4-byte big-endian length followed by that many
//! opaque payload bytes, one frame per record — bit-compatible with the
//! framing of Python's `logging.handlers.SocketHandler`, so existing
//! clients interoperate unchanged. Network I/O runs on the reactor
//! thread; payloads are handed to a single background [`LogWriter`],
//! which preserves arrival order across every log endpoint sharing it.

use std::io::{self, Error, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use indexmap::IndexMap;
use log::{debug, error, info, warn, LevelFilter};
use serde_json::Value;

use crate::addr::{address_kind, Address, AddressKind};
use crate::queue::BoundedQueue;
use crate::reactor::{Handler, RequestContext};
use crate::server::Server;
use crate::socket::{AcceptedStreamSocket, Socket, StreamSocket};

const REQUEST_QUEUE_SIZE: u32 = 5;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Where decoded payloads end up. Record deserialization belongs to the
/// sink; the server hands over raw frame bytes.
pub trait LogSink: Send + Sync {
    fn handle(&self, payload: &[u8], log_name: Option<&str>);
}

/// Default sink: renders each payload through the `log` facade under
/// the frame's log name.
pub struct StdLogSink;

impl LogSink for StdLogSink {
    fn handle(&self, payload: &[u8], log_name: Option<&str>) {
        let target = log_name.unwrap_or("multisock::records");
        info!(target: target, "{}", String::from_utf8_lossy(payload));
    }
}

type LogItem = (Vec<u8>, Option<String>);

/// The single background consumer draining record payloads to a sink.
///
/// One writer is shared by all log servers in a process so records keep
/// their arrival order across endpoints. `shutdown` flips the stop flag
/// and enqueues a sentinel; the consumer drains up to the sentinel and
/// exits.
#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<LogWriterInner>,
}

struct LogWriterInner {
    queue: BoundedQueue<Option<LogItem>>,
    stopped: AtomicBool,
}

impl LogWriter {
    pub fn new(sink: Arc<dyn LogSink>) -> LogWriter {
        LogWriter::with_capacity(DEFAULT_QUEUE_CAPACITY, sink)
    }

    pub fn with_capacity(capacity: usize, sink: Arc<dyn LogSink>) -> LogWriter {
        let inner = Arc::new(LogWriterInner {
            queue: BoundedQueue::with_capacity(capacity),
            stopped: AtomicBool::new(false),
        });

        let queue = inner.queue.clone();
        let spawned = thread::Builder::new()
            .name("multisock-logwriter".to_string())
            .spawn(move || {
                while let Some((payload, log_name)) = queue.pop() {
                    sink.handle(&payload, log_name.as_deref());
                }
            });
        if let Err(err) = spawned {
            error!("failed to spawn log writer thread: {}", err);
        }

        LogWriter { inner }
    }

    pub fn write_log(&self, payload: Vec<u8>, log_name: Option<String>) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        self.inner.queue.push(Some((payload, log_name)));
    }

    pub fn shutdown(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            self.inner.queue.push(None);
        }
    }
}

/// A listening endpoint speaking the log frame protocol.
///
/// Readiness on the listener accepts and registers the connection with
/// the reactor under this same server; the first frame is read on the
/// connection's own readiness event. A short length prefix means the
/// peer closed cleanly and the connection is dropped.
pub struct LogServer {
    socket: Arc<Socket>,
    writer: LogWriter,
    log_name: Option<String>,
}

impl LogServer {
    pub fn new(address: Address, writer: LogWriter) -> io::Result<LogServer> {
        // Unix endpoints reuse their path; TCP log endpoints bind fresh.
        let reuse = matches!(
            address_kind(&address),
            AddressKind::Unix | AddressKind::UnixAbstract
        );
        let listener = StreamSocket::new(address, REQUEST_QUEUE_SIZE, reuse)?;

        Ok(LogServer {
            socket: Arc::new(Socket::Listening(listener)),
            writer,
            log_name: None,
        })
    }

    /// Deliver every record from this endpoint under `name` instead of
    /// the name carried in the record itself.
    pub fn with_log_name(mut self, name: impl Into<String>) -> LogServer {
        self.log_name = Some(name.into());
        self
    }

    pub fn local_address(&self) -> Address {
        self.socket.local_address()
    }

    fn handle_record(&self, ctx: &mut RequestContext, socket: &Arc<Socket>, conn: &AcceptedStreamSocket) {
        let mut length = [0u8; 4];
        if conn.recv_exact(&mut length).is_err() {
            // Fewer than 4 bytes before EOF: the peer closed cleanly.
            debug!("log peer {} closed", conn);
            ctx.reactor.del_listener(socket);
            let _ = socket.close();
            return;
        }

        let length = u32::from_be_bytes(length) as usize;
        let mut payload = vec![0u8; length];
        if let Err(err) = conn.recv_exact(&mut payload) {
            warn!("short log frame from {}: {}", conn, err);
            ctx.reactor.del_listener(socket);
            let _ = socket.close();
            return;
        }

        self.writer.write_log(payload, self.log_name.clone());
    }
}

impl Handler for LogServer {
    fn dispatch(&self, ctx: &mut RequestContext, socket: &Arc<Socket>) {
        match &**socket {
            Socket::Listening(listener) => {
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
                if let Err(err) = ctx.reactor.add_listener(ctx.server.clone(), conn.clone()) {
                    error!("failed to manage log socket {}: {}", conn, err);
                    let _ = conn.close();
                }
            }
            Socket::Accepted(conn) => self.handle_record(ctx, socket, conn),
        }
    }

    fn listening(&self) -> Option<Arc<Socket>> {
        Some(self.socket.clone())
    }

    fn name(&self) -> &'static str {
        "LogServer"
    }
}

impl Server for LogServer {
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

/// A parsed config payload: a JSON object, or classical INI sections.
#[derive(Debug, Clone)]
pub enum LogConfig {
    Json(Value),
    Ini(IndexMap<String, IndexMap<String, String>>),
}

/// Applies a received [`LogConfig`]; injected so the core never touches
/// process-global state on its own.
pub trait ConfigApplier: Send + Sync {
    fn apply(&self, config: LogConfig);
}

/// Maps a `level` key (JSON top-level, or any INI section) to the `log`
/// facade's max level.
pub struct LevelApplier;

impl ConfigApplier for LevelApplier {
    fn apply(&self, config: LogConfig) {
        let level = match &config {
            LogConfig::Json(value) => value
                .get("level")
                .and_then(Value::as_str)
                .map(str::to_string),
            LogConfig::Ini(sections) => sections
                .values()
                .find_map(|section| section.get("level").cloned()),
        };

        let level = match level {
            Some(level) => level,
            None => return,
        };

        let filter = match level.to_ascii_lowercase().as_str() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" | "warning" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            "off" => LevelFilter::Off,
            other => {
                warn!("unknown log level in config: {:?}", other);
                return;
            }
        };
        log::set_max_level(filter);
        info!("log level set to {}", filter);
    }
}

/// A variant endpoint whose single frame is a configuration payload:
/// JSON is attempted first, then classical INI. Applied once per
/// connection, then the connection closes.
///
/// Remote configuration is a process-wide lever, so construction
/// demands an explicit opt-in.
pub struct LogConfigServer {
    socket: Arc<Socket>,
    applier: Arc<dyn ConfigApplier>,
}

impl std::fmt::Debug for LogConfigServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogConfigServer").finish_non_exhaustive()
    }
}

impl LogConfigServer {
    pub fn new(
        address: Address,
        applier: Arc<dyn ConfigApplier>,
        allow_remote_config: bool,
    ) -> io::Result<LogConfigServer> {
        if !allow_remote_config {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "remote log configuration must be explicitly enabled",
            ));
        }

        let reuse = matches!(
            address_kind(&address),
            AddressKind::Unix | AddressKind::UnixAbstract
        );
        let listener = StreamSocket::new(address, REQUEST_QUEUE_SIZE, reuse)?;

        Ok(LogConfigServer {
            socket: Arc::new(Socket::Listening(listener)),
            applier,
        })
    }

    pub fn local_address(&self) -> Address {
        self.socket.local_address()
    }

    fn handle_config(&self, conn: &AcceptedStreamSocket) {
        let mut length = [0u8; 4];
        if conn.recv_exact(&mut length).is_err() {
            return;
        }

        let length = u32::from_be_bytes(length) as usize;
        let mut payload = vec![0u8; length];
        if let Err(err) = conn.recv_exact(&mut payload) {
            warn!("short config frame from {}: {}", conn, err);
            return;
        }

        match parse_config(&payload) {
            Ok(config) => self.applier.apply(config),
            Err(err) => warn!("unusable config payload from {}: {}", conn, err),
        }
    }
}

impl Handler for LogConfigServer {
    fn dispatch(&self, _ctx: &mut RequestContext, socket: &Arc<Socket>) {
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

        self.handle_config(&conn);
        let _ = conn.close();
    }

    fn listening(&self) -> Option<Arc<Socket>> {
        Some(self.socket.clone())
    }

    fn name(&self) -> &'static str {
        "LogConfigServer"
    }
}

impl Server for LogConfigServer {
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

fn parse_config(payload: &[u8]) -> io::Result<LogConfig> {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        if value.is_object() {
            return Ok(LogConfig::Json(value));
        }
    }

    let text = std::str::from_utf8(payload)
        .map_err(|err| Error::new(ErrorKind::InvalidData, err))?;
    parse_ini(text).map(LogConfig::Ini)
}

/// Classical INI: `[section]` lines, `key = value` (or `key: value`)
/// entries, `#`/`;` comments.
pub fn parse_ini(text: &str) -> io::Result<IndexMap<String, IndexMap<String, String>>> {
    let mut sections: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
        } else if let Some(split) = line.find(&['=', ':'][..]) {
            let section = match &current {
                Some(section) => section,
                None => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "config entry outside of a section",
                    ))
                }
            };
            let key = line[..split].trim().to_string();
            let value = line[split + 1..].trim().to_string();
            if let Some(entries) = sections.get_mut(section) {
                entries.insert(key, value);
            }
        } else {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("malformed config line: {:?}", raw),
            ));
        }
    }

    if sections.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "config has no sections"));
    }
    Ok(sections)
}
