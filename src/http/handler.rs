//! Per-connection HTTP/1.1 machinery: request parsing, response
//! framing, keep-alive and Upgrade negotiation.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::http::{App, Body, Environ, HttpConfig, Response};
use crate::poller::wait_readable;
use crate::reactor::RequestContext;
use crate::socket::{AcceptedStreamSocket, Socket};
use crate::sys;
use crate::websocket::{SocketManager, UpgradedSocket};

const MAX_REQUEST_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

enum Outcome {
    KeepAlive,
    Close,
    Upgraded,
}

pub(crate) fn handle_connection(
    app: &Arc<dyn App>,
    config: &HttpConfig,
    manager: Option<&Arc<SocketManager>>,
    ctx: &mut RequestContext,
    socket: &Arc<Socket>,
) {
    let conn = match socket.as_accepted() {
        Some(conn) => conn,
        None => return,
    };

    if config.read_timeout.is_some() && conn.set_read_timeout(config.read_timeout).is_err() {
        return;
    }

    let mut connection = HttpConnection {
        app: app.as_ref(),
        config,
        manager,
        socket,
        conn,
        reader: BufReader::with_capacity(8 * 1024, conn),
        writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, conn),
        remote_host: None,
    };
    connection.handle(ctx);
}

struct HttpConnection<'a> {
    app: &'a dyn App,
    config: &'a HttpConfig,
    manager: Option<&'a Arc<SocketManager>>,
    socket: &'a Arc<Socket>,
    conn: &'a AcceptedStreamSocket,
    reader: BufReader<&'a AcceptedStreamSocket>,
    writer: BufWriter<&'a AcceptedStreamSocket>,
    remote_host: Option<String>,
}

impl<'a> HttpConnection<'a> {
    fn handle(&mut self, ctx: &mut RequestContext) {
        loop {
            match self.handle_one_request(ctx) {
                Outcome::Close => return,
                Outcome::Upgraded => {
                    ctx.close_connection = false;
                    return;
                }
                Outcome::KeepAlive => {
                    // Pipelined requests may already sit in the read
                    // buffer; the fd wait would never see them.
                    if !self.reader.buffer().is_empty() {
                        continue;
                    }
                    let timeout = self.config.keepalive_timeout;
                    if timeout == Duration::ZERO {
                        continue;
                    }
                    match wait_readable(self.conn.fileno(), Some(timeout)) {
                        Ok(true) => continue,
                        Ok(false) => {
                            debug!("keep-alive idle timeout on {}", self.conn);
                            return;
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }

    fn handle_one_request(&mut self, ctx: &mut RequestContext) -> Outcome {
        let head = match self.read_head() {
            Ok(Some(head)) => head,
            Ok(None) => return Outcome::Close,
            Err(err) => return self.read_failed(err),
        };

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let complete = matches!(parsed.parse(&head), Ok(httparse::Status::Complete(_)));
        let (method, target, version) = match (complete, parsed.method, parsed.path, parsed.version)
        {
            (true, Some(method), Some(target), Some(version)) => (method, target, version),
            _ => {
                warn!("malformed request from {}", self.conn);
                let _ = self.send_error_response("400 Bad Request");
                return Outcome::Close;
            }
        };
        let protocol = if version == 0 { "HTTP/1.0" } else { "HTTP/1.1" };
        let request_line = format!("{} {} {}", method, target, protocol);

        let mut environ = self.build_environ(method, target, protocol, &parsed);

        let content_length = environ
            .get("CONTENT_LENGTH")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            if let Err(err) = self.reader.read_exact(&mut body) {
                return self.read_failed(err);
            }
            environ.set_body(body);
        }

        let request_connection = environ
            .header("Connection")
            .map(|value| value.to_ascii_lowercase());

        let (mut response, app_failed) = match self.app.call(&environ) {
            Ok(response) => (response, false),
            Err(err) => {
                error!("application error for \"{}\": {}", request_line, err);
                let response = Response::new("500 Internal Server Error")
                    .header("Content-Type", "text/plain")
                    .bytes(&b"internal server error"[..]);
                (response, true)
            }
        };

        if self.config.pass_connection_headers && response.get_header("Connection").is_none() {
            if let Some(value) = request_connection.clone() {
                response.set_header("Connection", value);
            }
        }
        let response_connection = response
            .get_header("Connection")
            .map(|value| value.to_ascii_lowercase());

        let upgrade_factory = response.upgrade.take();

        let (status, bytes_sent) = match self.write_response(protocol, response) {
            Ok(done) => done,
            Err(err) => return self.write_failed(err),
        };

        info!(
            "{} - - \"{}\" {} {}",
            environ.remote_addr(),
            request_line,
            status,
            bytes_sent
        );

        if app_failed {
            return Outcome::Close;
        }

        if has_token(&response_connection, "upgrade") {
            if let (Some(factory), Some(manager)) = (upgrade_factory, self.manager) {
                let engine = factory(self.socket.clone());
                let upgraded = Arc::new(UpgradedSocket::new(self.socket.clone(), engine));
                if let Err(err) = manager.attach(&ctx.reactor, upgraded) {
                    error!("failed to attach upgraded socket {}: {}", self.conn, err);
                    return Outcome::Close;
                }
                return Outcome::Upgraded;
            }
            return Outcome::Close;
        }

        let close_seen = has_token(&request_connection, "close")
            || has_token(&response_connection, "close");
        let keep_alive = if protocol == "HTTP/1.1" {
            !close_seen && !has_token(&request_connection, "upgrade")
        } else {
            has_token(&request_connection, "keep-alive") && !close_seen
        };

        if keep_alive {
            Outcome::KeepAlive
        } else {
            Outcome::Close
        }
    }

    /// Reads one request head through the blank line, leaving anything
    /// after it (body, pipelined requests) in the buffer.
    fn read_head(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut head: Vec<u8> = Vec::new();

        loop {
            let (done, used) = {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    if head.is_empty() {
                        return Ok(None);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-request",
                    ));
                }

                let mut used = 0;
                let mut done = false;
                for &byte in buf {
                    head.push(byte);
                    used += 1;
                    if head.ends_with(b"\r\n\r\n") {
                        done = true;
                        break;
                    }
                }
                (done, used)
            };
            self.reader.consume(used);

            if done {
                return Ok(Some(head));
            }
            if head.len() > MAX_REQUEST_HEAD {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
        }
    }

    fn build_environ(
        &mut self,
        method: &str,
        target: &str,
        protocol: &str,
        parsed: &httparse::Request,
    ) -> Environ {
        let mut environ = Environ::new();

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        environ.insert("REQUEST_METHOD", method);
        environ.insert("SCRIPT_NAME", "");
        environ.insert("PATH_INFO", path);
        environ.insert("QUERY_STRING", query);
        environ.insert("SERVER_PROTOCOL", protocol);

        let local = self.conn.local_address();
        environ.insert("SERVER_NAME", local.host());
        environ.insert("SERVER_PORT", local.port().to_string());

        let remote = self.conn.remote_address();
        let remote_addr = remote.host();
        let remote_port = remote.port();
        environ.insert("REMOTE_ADDR", remote_addr.clone());
        environ.insert("REMOTE_PORT", remote_port.to_string());
        environ.insert("REMOTE_HOST", self.address_string(&remote_addr, remote_port));

        for header in parsed.headers.iter() {
            environ.add_header(header.name, &String::from_utf8_lossy(header.value));
        }

        environ
    }

    /// `REMOTE_HOST`: reverse-resolved only for ported (TCP) peers,
    /// for IPv6 only when enabled, for link-local only when enabled on
    /// top of that. Cached for the connection's lifetime.
    fn address_string(&mut self, addr: &str, port: u16) -> String {
        if let Some(cached) = &self.remote_host {
            return cached.clone();
        }

        let mut host = addr.to_string();
        if port != 0
            && (!addr.contains(':') || self.config.resolve_ipv6_address)
            && (!addr.contains('%') || self.config.resolve_ipv6_link_local_address)
        {
            let numeric = addr.split('%').next().unwrap_or(addr);
            if let Ok(ip) = numeric.parse::<IpAddr>() {
                if let Some(resolved) = sys::name_lookup(&ip) {
                    host = resolved;
                }
            }
        }

        self.remote_host = Some(host.clone());
        host
    }

    fn write_response(&mut self, protocol: &str, mut response: Response) -> io::Result<(u16, u64)> {
        let status = response.status_code();

        if response.get_header("Server").is_none() {
            response.set_header(
                "Server",
                concat!("multisock/", env!("CARGO_PKG_VERSION")).to_string(),
            );
        }

        let suppress_body = status < 200 || status == 204 || status == 304;
        let explicit_length = response.get_header("Content-Length").is_some();

        enum Framing {
            Buffered(Vec<u8>),
            Plain(Box<dyn Iterator<Item = Vec<u8>> + Send>),
            Chunked(Box<dyn Iterator<Item = Vec<u8>> + Send>),
        }

        let body = std::mem::replace(&mut response.body, Body::Empty);
        let framing = match body {
            Body::Stream(chunks) if !explicit_length && !suppress_body => {
                if protocol == "HTTP/1.0" {
                    // No chunked framing before HTTP/1.1; collect and
                    // send with a computed length instead.
                    let collected: Vec<u8> = chunks.flatten().collect();
                    response.set_header("Content-Length", collected.len().to_string());
                    Framing::Buffered(collected)
                } else {
                    response.set_header("Transfer-Encoding", "chunked".to_string());
                    Framing::Chunked(chunks)
                }
            }
            Body::Stream(chunks) => Framing::Plain(chunks),
            Body::Bytes(bytes) => {
                if !explicit_length && !suppress_body {
                    response.set_header("Content-Length", bytes.len().to_string());
                }
                Framing::Buffered(bytes)
            }
            Body::Empty => {
                if !explicit_length && !suppress_body {
                    response.set_header("Content-Length", "0".to_string());
                }
                Framing::Buffered(Vec::new())
            }
        };

        write!(self.writer, "HTTP/1.1 {}\r\n", response.status)?;
        for (name, value) in &response.headers {
            write!(self.writer, "{}: {}\r\n", name, value)?;
        }
        self.writer.write_all(b"\r\n")?;

        let mut bytes_sent: u64 = 0;
        match framing {
            Framing::Buffered(bytes) => {
                self.writer.write_all(&bytes)?;
                bytes_sent += bytes.len() as u64;
            }
            Framing::Plain(chunks) => {
                for chunk in chunks {
                    self.writer.write_all(&chunk)?;
                    bytes_sent += chunk.len() as u64;
                }
            }
            Framing::Chunked(chunks) => {
                bytes_sent += write_chunked(&mut self.writer, chunks)?;
            }
        }
        self.writer.flush()?;

        Ok((status, bytes_sent))
    }

    fn send_error_response(&mut self, status: &str) -> io::Result<()> {
        write!(
            self.writer,
            "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
            status
        )?;
        self.writer.flush()
    }

    fn read_failed(&mut self, err: io::Error) -> Outcome {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                info!("request timed out on {}: {}", self.conn, err);
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => {
                debug!("peer closed {}: {}", self.conn, err);
            }
            io::ErrorKind::InvalidData => {
                warn!("bad request from {}: {}", self.conn, err);
                let _ = self.send_error_response("400 Bad Request");
            }
            _ => {
                error!("request error on {}: {}", self.conn, err);
            }
        }
        Outcome::Close
    }

    fn write_failed(&mut self, err: io::Error) -> Outcome {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => {
                debug!("peer reset {}: {}", self.conn, err);
            }
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                info!("response timed out on {}: {}", self.conn, err);
            }
            _ => {
                error!("response error on {}: {}", self.conn, err);
            }
        }
        Outcome::Close
    }
}

/// Chunked transfer encoding: `{:x}\r\n{data}\r\n` per chunk, closed by
/// `0\r\n\r\n`. Empty producer chunks are skipped so they cannot end
/// the stream early. Returns the payload byte count.
fn write_chunked<W, I>(writer: &mut W, chunks: I) -> io::Result<u64>
where
    W: Write,
    I: Iterator<Item = Vec<u8>>,
{
    let mut written = 0;
    for chunk in chunks {
        if chunk.is_empty() {
            continue;
        }
        write!(writer, "{:x}\r\n", chunk.len())?;
        writer.write_all(&chunk)?;
        writer.write_all(b"\r\n")?;
        written += chunk.len() as u64;
    }
    writer.write_all(b"0\r\n\r\n")?;
    Ok(written)
}

fn has_token(value: &Option<String>, token: &str) -> bool {
    value
        .as_deref()
        .map_or(false, |value| value.split(',').any(|part| part.trim() == token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_frames_are_hex_sized() {
        let mut out = Vec::new();
        let chunks = vec![b"hel".to_vec(), b"lo".to_vec()].into_iter();
        let written = write_chunked(&mut out, chunks).unwrap();

        assert_eq!(written, 5);
        assert_eq!(out, b"3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n");
    }

    #[test]
    fn chunked_skips_empty_chunks() {
        let mut out = Vec::new();
        let chunks = vec![Vec::new(), b"abcdefghijklmnop".to_vec()].into_iter();
        write_chunked(&mut out, chunks).unwrap();

        assert_eq!(out, b"10\r\nabcdefghijklmnop\r\n0\r\n\r\n");
    }

    #[test]
    fn connection_tokens() {
        let value = Some("keep-alive, upgrade".to_string());
        assert!(has_token(&value, "keep-alive"));
        assert!(has_token(&value, "upgrade"));
        assert!(!has_token(&value, "close"));
        assert!(!has_token(&None, "close"));
    }
}
