//! S3/S4: a full HTTP request/response round trip through `HttpProcessor` +
//! `Router`, over a real loopback socket, exercising query-string and `Host`
//! header parsing end to end, including a request split mid-header across
//! two writes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use corehttpd::http::{HttpProcessor, MethodMask, RouteResponse, Router};
use corehttpd::net::socket::bind_all;
use corehttpd::net::worker_pool::WorkerPool;
use corehttpd::net::Acceptor;
use corehttpd::Config;

fn spawn_http_server() -> u16 {
    let listeners = bind_all(&[("127.0.0.1".to_string(), 0)], 128).unwrap();
    let port = listeners[0].listener.local_addr().unwrap().port();
    let config = Config::default();

    let mut router = Router::new();
    router.register(
        "/greet",
        MethodMask::ANY,
        "text/plain",
        Box::new(|req, _buf| {
            let name = req
                .query_value("name")
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_else(|| "world".to_string());
            RouteResponse::new(200, "text/plain", format!("hello, {name}\n").into_bytes())
        }),
    );
    router.register(
        "/host",
        MethodMask::ANY,
        "text/plain",
        Box::new(|req, buf| {
            let host = req
                .hostname(buf)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            RouteResponse::new(200, "text/plain", host.into_bytes())
        }),
    );

    let processor = HttpProcessor::new(router, &config);
    thread::spawn(move || {
        let mut acceptor = Acceptor::new(processor, config, listeners, WorkerPool::new()).unwrap();
        let _ = acceptor.run();
    });
    thread::sleep(Duration::from_millis(50));
    port
}

fn request(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    stream.write_all(raw.as_bytes()).unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn query_string_reaches_the_controller() {
    let port = spawn_http_server();
    let response = request(
        port,
        "GET /greet?name=rust HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello, rust\n"), "{response}");
}

#[test]
fn default_query_value_is_used_when_absent() {
    let port = spawn_http_server();
    let response = request(
        port,
        "GET /greet HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(response.ends_with("hello, world\n"), "{response}");
}

#[test]
fn host_header_is_extracted_without_port() {
    let port = spawn_http_server();
    let response = request(
        port,
        "GET /host HTTP/1.1\r\nHost: example.com:8080\r\nConnection: close\r\n\r\n",
    );
    assert!(response.ends_with("example.com"), "{response}");
}

#[test]
fn unmatched_route_returns_404() {
    let port = spawn_http_server();
    let response = request(
        port,
        "GET /nope HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 404 ER"), "{response}");
}

#[test]
fn request_split_mid_host_header_still_parses() {
    let port = spawn_http_server();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    stream
        .write_all(b"GET /host HTTP/1.1\r\nHo")
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    stream
        .write_all(b"st: example.com:8080\r\nConnection: close\r\n\r\n")
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
    let response = String::from_utf8_lossy(&response).into_owned();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("example.com"), "{response}");
}
