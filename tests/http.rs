use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use multisock::http::{App, AppError, Environ, HttpConfig, HttpServer, Response};
use multisock::websocket::{ProtocolEngine, SocketManager};
use multisock::{Address, MultiServer, Socket};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn echo_app() -> Arc<dyn App> {
    Arc::new(|environ: &Environ| -> Result<Response, AppError> {
        let echo = environ.header("X-Echo").unwrap_or("").to_string();
        Ok(Response::new("200 OK").bytes(echo))
    })
}

fn start(multi: Arc<MultiServer>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        multi.run(Duration::from_millis(50)).unwrap();
    })
}

fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "eof before end of headers");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let mut content_length = 0;
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap();
            }
        }
    }

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn keepalive_pipelined_requests_then_idle_close() {
    init_logging();

    let multi = Arc::new(MultiServer::new().unwrap());
    let config = HttpConfig {
        keepalive_timeout: Duration::from_millis(400),
        ..HttpConfig::default()
    };
    let server = Arc::new(
        HttpServer::new(Address::inet("127.0.0.1", 0), echo_app())
            .unwrap()
            .with_config(config),
    );
    multi.add_server(server.clone()).unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let requests = "GET / HTTP/1.1\r\nHost: test\r\nConnection: keep-alive\r\nX-Echo: one\r\n\r\n\
                    GET / HTTP/1.1\r\nHost: test\r\nConnection: keep-alive\r\nX-Echo: two\r\n\r\n";
    stream.write_all(requests.as_bytes()).unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);
    assert_eq!(body, b"one");

    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"two");

    // The connection idles past the keep-alive timeout: the server
    // closes and the next read reports EOF.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    multi.shutdown();
    handle.join().unwrap();
}

#[test]
fn chunked_stream_body_exact_frames() {
    init_logging();

    let app = Arc::new(|_: &Environ| -> Result<Response, AppError> {
        let chunks = vec![b"hel".to_vec(), b"lo".to_vec()];
        Ok(Response::new("200 OK").stream(chunks.into_iter()))
    });
    let multi = Arc::new(MultiServer::new().unwrap());
    let server = multi
        .http_server(Address::inet("127.0.0.1", 0), app)
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8(raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();

    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Transfer-Encoding: chunked"));
    assert!(!head.to_ascii_lowercase().contains("content-length"));
    assert_eq!(body, "3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n");

    multi.shutdown();
    handle.join().unwrap();
}

#[test]
fn explicit_content_length_streams_exact_bytes() {
    init_logging();

    let app = Arc::new(|_: &Environ| -> Result<Response, AppError> {
        Ok(Response::new("200 OK")
            .header("Content-Length", "5")
            .bytes(&b"exact"[..]))
    });
    let multi = Arc::new(MultiServer::new().unwrap());
    let server = multi
        .http_server(Address::inet("127.0.0.1", 0), app)
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-Length: 5"));
    assert_eq!(body, b"exact");

    multi.shutdown();
    handle.join().unwrap();
}

#[test]
fn http_10_closes_by_default() {
    init_logging();

    let multi = Arc::new(MultiServer::new().unwrap());
    let server = multi
        .http_server(Address::inet("127.0.0.1", 0), echo_app())
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.0\r\nX-Echo: ten\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"));
    assert!(raw.ends_with("ten"));

    multi.shutdown();
    handle.join().unwrap();
}

#[test]
fn malformed_request_gets_400() {
    init_logging();

    let multi = Arc::new(MultiServer::new().unwrap());
    let server = multi
        .http_server(Address::inet("127.0.0.1", 0), echo_app())
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"not an http request\r\n\r\n").unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    assert!(String::from_utf8(raw).unwrap().starts_with("HTTP/1.1 400"));

    multi.shutdown();
    handle.join().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn abstract_unix_socket_renders_remote_addr_with_at() {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixStream};

    init_logging();

    let name = format!("msock-test-{}", std::process::id());
    let app = Arc::new(|environ: &Environ| -> Result<Response, AppError> {
        Ok(Response::new("200 OK").bytes(environ.remote_addr().to_string()))
    });

    let multi = Arc::new(MultiServer::new().unwrap());
    multi
        .http_server(Address::from_path(format!("\0{}", name)).unwrap(), app)
        .unwrap();
    let handle = start(multi.clone());

    let sock_addr = UnixSocketAddr::from_abstract_name(name.as_bytes()).unwrap();
    let mut stream = UnixStream::connect_addr(&sock_addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8(raw).unwrap();
    let (_, body) = raw.split_once("\r\n\r\n").unwrap();
    assert_eq!(body, format!("@{}", name));

    multi.shutdown();
    handle.join().unwrap();
}

struct EchoEngine {
    socket: Arc<Socket>,
    terminated: AtomicBool,
    received: Arc<Mutex<Vec<u8>>>,
}

impl ProtocolEngine for EchoEngine {
    fn once(&self) -> bool {
        let conn = match self.socket.as_accepted() {
            Some(conn) => conn,
            None => return false,
        };
        let mut buf = [0u8; 256];
        match conn.recv(&mut buf) {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.received.lock().unwrap().extend_from_slice(&buf[..n]);
                let _ = conn.send(&buf[..n]);
                true
            }
        }
    }

    fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _ = self.socket.close();
    }

    fn send(&self, message: &[u8], _binary: bool) -> io::Result<()> {
        match self.socket.as_accepted() {
            Some(conn) => conn.send(message).map(drop),
            None => Ok(()),
        }
    }

    fn close(&self, _code: u16, _reason: &str) {
        self.terminate();
    }
}

#[test]
fn upgrade_hands_socket_to_manager() {
    init_logging();

    let manager = SocketManager::new();
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let app = {
        let received = received.clone();
        Arc::new(move |environ: &Environ| -> Result<Response, AppError> {
            assert_eq!(environ.header("Upgrade"), Some("echo"));
            let received = received.clone();
            Ok(Response::new("101 Switching Protocols")
                .header("Upgrade", "echo")
                .header("Connection", "Upgrade")
                .upgrade(Box::new(move |socket| {
                    Box::new(EchoEngine {
                        socket,
                        terminated: AtomicBool::new(false),
                        received,
                    })
                })))
        })
    };

    let multi = Arc::new(MultiServer::new().unwrap());
    let server = Arc::new(
        HttpServer::new(Address::inet("127.0.0.1", 0), app)
            .unwrap()
            .with_manager(manager.clone()),
    );
    multi.add_server(server.clone()).unwrap();
    multi.add_server(manager.clone()).unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: test\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n",
        )
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);
    assert!(body.is_empty());

    // The socket now lives in the manager; readiness drives the engine.
    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(&*received.lock().unwrap(), b"ping");

    manager.broadcast(b"fanout", false);
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"fanout");

    // Peer close: the engine reports done, the manager detaches.
    drop(stream);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager.sockets().is_empty() {
        assert!(Instant::now() < deadline, "socket never detached");
        thread::sleep(Duration::from_millis(20));
    }

    multi.shutdown();
    handle.join().unwrap();
}

#[test]
fn graceful_shutdown_completes_inflight_requests() {
    init_logging();

    let app = Arc::new(|_: &Environ| -> Result<Response, AppError> {
        thread::sleep(Duration::from_millis(300));
        Ok(Response::new("200 OK").bytes(&b"done"[..]))
    });
    let multi = Arc::new(MultiServer::new().unwrap());
    let server = multi
        .http_server(Address::inet("127.0.0.1", 0), app)
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut first = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut second = TcpStream::connect(("127.0.0.1", port)).unwrap();
    for stream in [&mut first, &mut second] {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .unwrap();
    }

    // Both requests are on worker threads; stop the server under them.
    thread::sleep(Duration::from_millis(100));
    multi.shutdown();
    handle.join().unwrap();

    let (_, body) = read_response(&mut first);
    assert_eq!(body, b"done");
    let (_, body) = read_response(&mut second);
    assert_eq!(body, b"done");

    // The listener is gone; new connections are refused.
    assert!(TcpStream::connect_timeout(
        &("127.0.0.1".parse::<std::net::IpAddr>().unwrap(), port).into(),
        Duration::from_millis(500),
    )
    .is_err());
}
