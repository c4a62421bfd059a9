use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use multisock::http::{App, AppError, Environ, Response};
use multisock::logging::{ConfigApplier, LogConfig, LogSink};
use multisock::{Address, MultiServer};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start(multi: Arc<MultiServer>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        multi.run(Duration::from_millis(50)).unwrap();
    })
}

fn temp_sock_path(name: &str) -> String {
    format!(
        "{}/multisock-{}-{}.sock",
        std::env::temp_dir().display(),
        name,
        std::process::id()
    )
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}

#[derive(Default)]
struct RecordingSink {
    items: Mutex<Vec<(Vec<u8>, Option<String>)>>,
}

impl LogSink for RecordingSink {
    fn handle(&self, payload: &[u8], log_name: Option<&str>) {
        self.items
            .lock()
            .unwrap()
            .push((payload.to_vec(), log_name.map(str::to_string)));
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn single_frame_reaches_the_sink() {
    init_logging();

    let path = temp_sock_path("single");
    let sink = Arc::new(RecordingSink::default());

    let multi = Arc::new(MultiServer::new().unwrap());
    multi.set_log_sink(sink.clone());
    multi
        .log_server(Address::from_path(path.clone()).unwrap(), None)
        .unwrap();
    let handle = start(multi.clone());

    let mut client = UnixStream::connect(&path).unwrap();
    client.write_all(&[0, 0, 0, 5]).unwrap();
    client.write_all(b"hello").unwrap();

    wait_for("the record", || !sink.items.lock().unwrap().is_empty());
    {
        let items = sink.items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, b"hello");
        assert_eq!(items[0].1, None);
    }

    drop(client);
    multi.shutdown();
    handle.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn frames_are_delivered_in_order_under_a_log_name() {
    init_logging();

    let path = temp_sock_path("order");
    let sink = Arc::new(RecordingSink::default());

    let multi = Arc::new(MultiServer::new().unwrap());
    multi.set_log_sink(sink.clone());
    multi
        .log_server(Address::from_path(path.clone()).unwrap(), Some("wire"))
        .unwrap();
    let handle = start(multi.clone());

    let mut client = UnixStream::connect(&path).unwrap();
    for i in 0..5 {
        client
            .write_all(&frame(format!("record-{}", i).as_bytes()))
            .unwrap();
    }

    wait_for("all records", || sink.items.lock().unwrap().len() == 5);
    {
        let items = sink.items.lock().unwrap();
        for (i, (payload, log_name)) in items.iter().enumerate() {
            assert_eq!(payload, format!("record-{}", i).as_bytes());
            assert_eq!(log_name.as_deref(), Some("wire"));
        }
    }

    drop(client);
    multi.shutdown();
    handle.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn short_frame_closes_the_connection_silently() {
    init_logging();

    let sink = Arc::new(RecordingSink::default());
    let multi = Arc::new(MultiServer::new().unwrap());
    multi.set_log_sink(sink.clone());
    let server = multi
        .log_server(Address::inet("127.0.0.1", 0), None)
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    // Two bytes of a length prefix, then EOF: a clean peer close.
    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(&[0, 0]).unwrap();
    drop(client);

    thread::sleep(Duration::from_millis(300));
    assert!(sink.items.lock().unwrap().is_empty());

    // The endpoint still serves later clients.
    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(&frame(b"after")).unwrap();
    wait_for("the record", || !sink.items.lock().unwrap().is_empty());
    assert_eq!(sink.items.lock().unwrap()[0].0, b"after");

    multi.shutdown();
    handle.join().unwrap();
}

#[test]
fn http_and_log_servers_share_one_reactor() {
    init_logging();

    let path = temp_sock_path("shared");
    let sink = Arc::new(RecordingSink::default());
    let app: Arc<dyn App> = Arc::new(|environ: &Environ| -> Result<Response, AppError> {
        Ok(Response::new("200 OK").bytes(environ.header("X-Echo").unwrap_or("").to_string()))
    });

    let multi = Arc::new(MultiServer::new().unwrap());
    multi.set_log_sink(sink.clone());
    let http = multi
        .http_server(Address::inet("127.0.0.1", 0), app)
        .unwrap();
    multi
        .log_server(Address::from_path(path.clone()).unwrap(), None)
        .unwrap();
    let port = http.local_address().port();
    let handle = start(multi.clone());

    // A log connection registered from inside dispatch gets readiness
    // on the next cycle, interleaved with HTTP traffic.
    let mut log_client = UnixStream::connect(&path).unwrap();
    log_client.write_all(&frame(b"interleaved")).unwrap();

    let mut http_client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    http_client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    http_client
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nX-Echo: hi\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut raw = Vec::new();
    http_client.read_to_end(&mut raw).unwrap();
    assert!(String::from_utf8_lossy(&raw).ends_with("hi"));

    wait_for("the record", || !sink.items.lock().unwrap().is_empty());
    assert_eq!(sink.items.lock().unwrap()[0].0, b"interleaved");

    drop(log_client);
    multi.shutdown();
    handle.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[derive(Default)]
struct RecordingApplier {
    configs: Mutex<Vec<LogConfig>>,
}

impl ConfigApplier for RecordingApplier {
    fn apply(&self, config: LogConfig) {
        self.configs.lock().unwrap().push(config);
    }
}

#[test]
fn config_server_applies_json_then_ini() {
    init_logging();

    let applier = Arc::new(RecordingApplier::default());
    let multi = Arc::new(MultiServer::new().unwrap());
    let server = multi
        .log_config_server(Address::inet("127.0.0.1", 0), applier.clone(), true)
        .unwrap();
    let port = server.local_address().port();
    let handle = start(multi.clone());

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .write_all(&frame(br#"{"level": "debug"}"#))
        .unwrap();
    drop(client);

    wait_for("the json config", || {
        !applier.configs.lock().unwrap().is_empty()
    });
    match &applier.configs.lock().unwrap()[0] {
        LogConfig::Json(value) => assert_eq!(value["level"], "debug"),
        other => panic!("expected json, got {:?}", other),
    }

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .write_all(&frame(b"[logger]\nlevel = warn\n"))
        .unwrap();
    drop(client);

    wait_for("the ini config", || applier.configs.lock().unwrap().len() == 2);
    match &applier.configs.lock().unwrap()[1] {
        LogConfig::Ini(sections) => assert_eq!(sections["logger"]["level"], "warn"),
        other => panic!("expected ini, got {:?}", other),
    }

    multi.shutdown();
    handle.join().unwrap();
}
