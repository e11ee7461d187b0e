//! End-to-end tests over real TCP connections.
//!
//! Each test builds a document root in a temp directory, starts a server
//! on an ephemeral loopback port, and speaks raw HTTP/1.1 to it.

use std::fs;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use darkhttpd::config::Config;
use darkhttpd::server::Server;
use tempfile::TempDir;

fn base_config(root: &Path) -> Config {
    Config {
        root: root.to_str().unwrap().to_owned(),
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_connections: None,
        log_path: None,
        want_chroot: false,
        index_name: "index.html".to_owned(),
        mimetypes_path: None,
        idle_timeout: 60,
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

fn spawn_server(config: Config) -> TestServer {
    let mut server = Server::new(&config).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let handle = thread::spawn(move || {
        server.run(flag).unwrap();
    });
    TestServer {
        addr,
        shutdown,
        handle,
    }
}

fn simple_root() -> TempDir {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("index.html"), b"hi\n").unwrap();
    root
}

/// Read until the server closes the connection.  A reset after the
/// response still counts as the end of the stream.
fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    response
}

fn send_request(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request).unwrap();
    read_response(&mut stream)
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("no header terminator in response")
        + 4;
    (
        String::from_utf8_lossy(&raw[..pos]).into_owned(),
        raw[pos..].to_vec(),
    )
}

fn header_value(head: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}: ");
    head.lines()
        .find_map(|line| line.strip_prefix(&prefix).map(|v| v.trim_end().to_owned()))
}

#[test]
fn get_serves_the_index_file() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(header_value(&head, "Content-Length").as_deref(), Some("3"));
    assert_eq!(
        header_value(&head, "Content-Type").as_deref(),
        Some("text/html")
    );
    assert_eq!(
        header_value(&head, "Server").as_deref(),
        Some("darkhttpd/0.1")
    );
    assert_eq!(
        header_value(&head, "Connection").as_deref(),
        Some("close")
    );
    assert!(header_value(&head, "Last-Modified").is_some());
    assert!(header_value(&head, "Date").is_some());
    assert_eq!(body, b"hi\n");
}

#[test]
fn head_sends_headers_without_a_body() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"HEAD / HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header_value(&head, "Content-Length").as_deref(), Some("3"));
    assert!(body.is_empty());
}

#[test]
fn exact_if_modified_since_gets_304() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET / HTTP/1.1\r\n\r\n");
    let (head, _) = split_response(&raw);
    let lastmod = header_value(&head, "Last-Modified").unwrap();

    let conditional = format!("GET / HTTP/1.1\r\nIf-Modified-Since: {lastmod}\r\n\r\n");
    let raw = send_request(server.addr, conditional.as_bytes());
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "head: {head}");
    assert!(body.is_empty());

    // one character of difference must produce a full 200
    let mut off = lastmod.clone();
    off.replace_range(0..1, "X");
    let stale = format!("GET / HTTP/1.1\r\nIf-Modified-Since: {off}\r\n\r\n");
    let raw = send_request(server.addr, stale.as_bytes());
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"hi\n");
}

#[test]
fn traversal_attempts_get_400() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("/../etc/passwd"), "body: {body}");

    // the same attempt hidden behind percent-encoding
    let raw = send_request(server.addr, b"GET /%2e%2e/etc/passwd HTTP/1.1\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn missing_files_get_404() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET /nope HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("/nope"));
}

#[test]
fn unsupported_and_unknown_methods() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"POST / HTTP/1.1\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 501 Not Implemented\r\n"));

    let raw = send_request(server.addr, b"BREW /pot HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("BREW"));
}

#[test]
fn oversized_requests_get_413() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let mut stream = TcpStream::connect(server.addr).unwrap();

    // exactly 4000 bytes without a terminator is still within bounds
    stream.write_all(&[b'A'; 4000]).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let mut probe = [0u8; 64];
    match stream.read(&mut probe) {
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut => {}
        other => panic!("server reacted to a 4000-byte request: {other:?}"),
    }

    // one more byte crosses the limit
    stream.write_all(b"B").unwrap();
    let raw = read_response(&mut stream);
    let (head, _) = split_response(&raw);
    assert!(
        head.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"),
        "head: {head}"
    );
}

#[test]
fn trailing_slash_serves_the_directory_index() {
    let root = simple_root();
    fs::create_dir(root.path().join("sub")).unwrap();
    fs::write(root.path().join("sub/index.html"), b"<p>sub</p>").unwrap();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET /sub/ HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(
        header_value(&head, "Content-Type").as_deref(),
        Some("text/html")
    );
    assert_eq!(body, b"<p>sub</p>");
}

#[test]
fn percent_encoded_targets_are_decoded() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET /%69ndex.html HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"hi\n");
}

#[test]
fn unknown_extensions_are_octet_stream() {
    let root = simple_root();
    fs::write(root.path().join("blob.xyz"), b"data").unwrap();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET /blob.xyz HTTP/1.1\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert_eq!(
        header_value(&head, "Content-Type").as_deref(),
        Some("application/octet-stream")
    );
}

#[test]
fn mimetypes_file_extends_the_builtin_table() {
    let root = simple_root();
    fs::write(root.path().join("data.custom"), b"x").unwrap();
    let mime_path = root.path().join("mime.types");
    fs::write(&mime_path, "# test types\ntext/x-custom custom\n").unwrap();

    let mut config = base_config(root.path());
    config.mimetypes_path = Some(mime_path);
    let server = spawn_server(config);

    let raw = send_request(server.addr, b"GET /data.custom HTTP/1.1\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert_eq!(
        header_value(&head, "Content-Type").as_deref(),
        Some("text/x-custom")
    );
}

#[test]
fn empty_files_are_served_with_zero_length() {
    let root = simple_root();
    fs::write(root.path().join("empty.txt"), b"").unwrap();
    let server = spawn_server(base_config(root.path()));

    let raw = send_request(server.addr, b"GET /empty.txt HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header_value(&head, "Content-Length").as_deref(), Some("0"));
    assert!(body.is_empty());
}

#[test]
fn request_split_across_writes_still_parses() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.write_all(b"GET / HT").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"TP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let raw = read_response(&mut stream);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"hi\n");
}

#[test]
fn two_interleaved_connections_are_both_served() {
    let root = simple_root();
    fs::write(root.path().join("other.txt"), b"other\n").unwrap();
    let server = spawn_server(base_config(root.path()));

    let mut first = TcpStream::connect(server.addr).unwrap();
    let mut second = TcpStream::connect(server.addr).unwrap();

    // the later connection finishes first
    second.write_all(b"GET /other.txt HTTP/1.1\r\n\r\n").unwrap();
    let raw = read_response(&mut second);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"other\n");

    first.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let raw = read_response(&mut first);
    let (_, body) = split_response(&raw);
    assert_eq!(body, b"hi\n");
}

#[test]
fn access_log_records_completed_connections() {
    let root = simple_root();
    let log_path = root.path().join("access.log");
    let mut config = base_config(root.path());
    config.log_path = Some(log_path.clone());
    let server = spawn_server(config);

    let request = b"GET /index.html HTTP/1.1\r\n\
                    Referer: http://example.com/\r\n\
                    User-Agent: integration-test\r\n\r\n";
    // the record is flushed before the socket closes, so once the client
    // sees the end of the stream the line is on disk
    send_request(server.addr, request);
    send_request(server.addr, b"GET /nope HTTP/1.1\r\n\r\n");

    let contents = fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2, "log: {contents:?}");

    let fields: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(fields.len(), 8, "line: {:?}", lines[0]);
    assert_eq!(fields[1], "127.0.0.1");
    assert_eq!(fields[2], "GET");
    assert_eq!(fields[3], "/index.html");
    assert_eq!(fields[4], "200");
    assert!(fields[5].parse::<u64>().unwrap() > 3);
    assert_eq!(fields[6], "\"http://example.com/\"");
    assert_eq!(fields[7], "\"integration-test\"");

    let fields: Vec<&str> = lines[1].split('\t').collect();
    assert_eq!(fields[3], "/nope");
    assert_eq!(fields[4], "404");
    assert_eq!(fields[6], "\"\"");
    assert_eq!(fields[7], "\"\"");
}

#[test]
fn idle_connections_are_closed_by_the_timeout() {
    let root = simple_root();
    let mut config = base_config(root.path());
    config.idle_timeout = 1;
    let server = spawn_server(config);

    let started = std::time::Instant::now();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    let raw = read_response(&mut stream);
    assert!(raw.is_empty(), "idle connection got data: {raw:?}");
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "connection was not closed by the idle sweep"
    );
}

#[test]
fn shutdown_flag_stops_the_server() {
    let root = simple_root();
    let server = spawn_server(base_config(root.path()));

    send_request(server.addr, b"GET / HTTP/1.1\r\n\r\n");

    server.shutdown.store(true, Ordering::Release);
    // wake the event loop so it notices the flag
    drop(TcpStream::connect(server.addr));
    server.handle.join().expect("server thread panicked");
}
