//! End-to-end tests driving a real `Server` over a real loopback socket,
//! the way `s2n-quic-dc` places its stream-level integration tests under
//! `tests/` instead of `#[cfg(test)]` modules, since these need a second
//! peer (a raw `TcpStream`) rather than just in-process state.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use votecore_http::{Router, Server, ServerConfig};

fn spawn_test_server(router: Router, config: ServerConfig) -> std::net::SocketAddr {
    let server = Server::new(config, router);
    let bound = server.bind().expect("bind should succeed on an ephemeral port");
    let addr = bound.local_addr().expect("bound socket has a local address");
    std::thread::spawn(move || bound.run());
    addr
}

fn read_response(stream: &mut TcpStream) -> String {
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                // A response is complete once we've seen the blank line and
                // have at least as many body bytes as Content-Length says.
                if let Some(complete) = response_is_complete(&buf) {
                    if complete {
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn response_is_complete(buf: &[u8]) -> Option<bool> {
    let text = String::from_utf8_lossy(buf);
    let header_end = text.find("\r\n\r\n")? + 4;
    let content_length: usize = text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            (name.eq_ignore_ascii_case("content-length")).then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    Some(buf.len() >= header_end + content_length)
}

fn base_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        workers: 2,
        idle_timeout: Duration::from_millis(300),
        handshake_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    }
}

#[test]
fn keep_alive_serves_two_requests_over_one_connection() {
    let mut router = Router::new();
    router.add_route("GET", "/ping", |_req, _caps, _ctx| {
        votecore_http::status_response(200, "OK")
    });

    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();

    stream
        .write_all(b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream);
    assert!(first.starts_with("HTTP/1.1 200"), "first response: {first}");

    // Same socket, second request: the connection must still be open.
    stream.write_all(b"GET /ping HTTP/1.1\r\n\r\n").unwrap();
    let second = read_response(&mut stream);
    assert!(second.starts_with("HTTP/1.1 200"), "second response: {second}");
}

#[test]
fn connection_close_ends_the_socket_after_one_response() {
    let mut router = Router::new();
    router.add_route("GET", "/ping", |_req, _caps, _ctx| {
        votecore_http::status_response(200, "OK")
    });

    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200"));

    // The peer should have closed its end; further reads see EOF (0 bytes)
    // rather than blocking forever.
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "connection: close should close the socket");
}

#[test]
fn connection_close_response_carries_an_explicit_header() {
    let mut router = Router::new();
    router.add_route("GET", "/ping", |_req, _caps, _ctx| {
        votecore_http::status_response(200, "OK")
    });

    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(
        response.to_ascii_lowercase().contains("connection: close"),
        "an HTTP/1.1 response that closes must say so explicitly: {response}"
    );
}

#[test]
fn query_string_and_percent_decoding_reach_the_handler() {
    let mut router = Router::new();
    router.add_route("GET", "/echo", |request, _caps, _ctx| {
        let body = format!("{}|{:?}", request.path, request.query);
        votecore_http::status_response(200, "OK").with_body(body)
    });

    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /echo?a=1&b=%2F HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.contains("a") && response.contains("1"), "{response}");
}

#[test]
fn oversized_headers_are_rejected_with_413() {
    let router = Router::new();
    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();

    let mut request = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
    request.extend(std::iter::repeat(b'a').take(40 * 1024));
    request.extend_from_slice(b"\r\n\r\n");
    stream.write_all(&request).unwrap();

    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 413"), "{response}");
}

#[test]
fn named_capture_groups_are_available_to_the_handler() {
    let mut router = Router::new();
    router.add_route("GET", r"/users/(?<id>[0-9]+)", |_req, caps, _ctx| {
        let id = caps.get("id").unwrap_or("?");
        votecore_http::status_response(200, "OK").with_body(id.to_string())
    });

    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /users/42 HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.ends_with("42"), "{response}");
}

#[test]
fn idle_connections_are_closed_by_the_timeout_sweep() {
    let router = Router::new();
    let addr = spawn_test_server(router, base_config());
    let mut stream = TcpStream::connect(addr).unwrap();

    // Send nothing; the handshake timeout (200ms in base_config) should
    // close this socket well before our own read timeout fires.
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "idle connection should be closed by the sweep");
}

