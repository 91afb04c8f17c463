//! End-to-end coverage of the HTTP pub/sub tail against a live listener.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use eventstream::clock::{Clock, MockClock};
use eventstream::http::{HttpEndpointConfig, PayloadSchema, PubSubHttpEndpoint};
use eventstream::persister::MemoryPersister;
use eventstream::Stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tick {
    value: String,
}

impl PayloadSchema for Tick {
    fn json_schema() -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": { "value": { "type": "string" } } })
    }
}

fn spawn_endpoint(stream: Arc<Stream<Tick>>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let endpoint = PubSubHttpEndpoint::with_config(stream, HttpEndpointConfig::default());
    std::thread::spawn(move || {
        let _ = endpoint.serve(listener);
    });
    addr
}

fn read_headers(reader: &mut BufReader<TcpStream>) -> Vec<String> {
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line.trim().is_empty() {
            break;
        }
        headers.push(line.trim().to_string());
    }
    headers
}

/// Reads and concatenates a chunked-encoding body until the terminating
/// zero-length chunk.
fn read_chunked_body(reader: &mut BufReader<TcpStream>) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).unwrap() == 0 {
            break;
        }
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
        if size == 0 {
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).unwrap();
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).unwrap();
    }
    body
}

#[test]
fn http_tail_with_n_and_recent_s7() {
    let clock = Arc::new(MockClock::new(500));
    let persister = Arc::new(MemoryPersister::<Tick>::new());
    let stream = Stream::new(persister, Arc::clone(&clock) as Arc<dyn Clock>);
    for us in [100, 200, 300, 400] {
        stream
            .publish_at(Tick { value: format!("v{us}") }, us)
            .unwrap();
    }

    let addr = spawn_endpoint(stream);
    let mut conn = TcpStream::connect(addr).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(conn, "GET /exposed?n=2&recent=399 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let mut reader = BufReader::new(conn);
    let headers = read_headers(&mut reader);
    assert!(headers.iter().any(|h| h.starts_with("Transfer-Encoding: chunked")));
    let body = read_chunked_body(&mut reader);
    let text = String::from_utf8(body).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"us\":200") && lines[0].contains("v200"));
    assert!(lines[1].contains("\"us\":300") && lines[1].contains("v300"));
}

#[test]
fn http_terminate_closes_matching_connection_s8() {
    let clock = Arc::new(MockClock::new(0));
    let persister = Arc::new(MemoryPersister::<Tick>::new());
    let stream = Stream::new(persister, Arc::clone(&clock) as Arc<dyn Clock>);

    let addr = spawn_endpoint(stream);
    let mut tail_conn = TcpStream::connect(addr).unwrap();
    tail_conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(tail_conn, "GET /exposed HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let mut tail_reader = BufReader::new(tail_conn);
    let headers = read_headers(&mut tail_reader);
    let subscription_id = headers
        .iter()
        .find_map(|h| h.strip_prefix("Subscription-Id: "))
        .expect("subscription id header present")
        .to_string();

    let mut terminate_conn = TcpStream::connect(addr).unwrap();
    terminate_conn
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        terminate_conn,
        "GET /exposed?terminate={subscription_id} HTTP/1.1\r\nHost: x\r\n\r\n"
    )
    .unwrap();
    let mut terminate_reader = BufReader::new(terminate_conn);
    let terminate_headers = read_headers(&mut terminate_reader);
    assert!(terminate_headers[0].contains("200"));
    let mut terminate_body = Vec::new();
    terminate_reader.read_to_end(&mut terminate_body).unwrap();
    assert!(terminate_body.is_empty());

    let closing_body = read_chunked_body(&mut tail_reader);
    assert!(closing_body.is_empty());
}
