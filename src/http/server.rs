//! A minimal synchronous HTTP/1.1 listener just capable enough to drive
//! [`PubSubHttpEndpoint`]: one thread per connection, `GET`/`HEAD` only,
//! no keep-alive, no request body.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::Entry;
use crate::error::Error;
use crate::registry::Registry;
use crate::stream::Stream;
use crate::subscriber::{CallbackResponse, SubscriberOptions};

use super::query::{MalformedQuery, SubscriptionQuery};

/// Describes the payload type `E` for the `schema` query parameter.
/// `json_schema_as` is consulted for `schema=<lang>`; an unrecognized
/// language should return `None`, which the endpoint turns into a 404.
pub trait PayloadSchema {
    fn json_schema() -> serde_json::Value;

    fn json_schema_as(lang: &str) -> Option<serde_json::Value> {
        match lang {
            "json" => Some(Self::json_schema()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpEndpointConfig {
    pub max_query_bytes: usize,
    pub subscription_id_len: usize,
}

impl Default for HttpEndpointConfig {
    fn default() -> Self {
        Self {
            max_query_bytes: 8192,
            subscription_id_len: 12,
        }
    }
}

/// Drives one stream's subscription traffic over plain HTTP/1.1.
pub struct PubSubHttpEndpoint<E> {
    stream: Arc<Stream<E>>,
    registry: Arc<Registry>,
    config: HttpEndpointConfig,
}

impl<E> PubSubHttpEndpoint<E>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + PayloadSchema + 'static,
{
    pub fn new(stream: Arc<Stream<E>>) -> Arc<Self> {
        Self::with_config(stream, HttpEndpointConfig::default())
    }

    pub fn with_config(stream: Arc<Stream<E>>, config: HttpEndpointConfig) -> Arc<Self> {
        Arc::new(Self {
            stream,
            registry: Arc::new(Registry::new()),
            config,
        })
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        self.registry.active_subscriptions()
    }

    /// Accepts connections forever, spawning one thread per connection.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        for incoming in listener.incoming() {
            let conn = incoming?;
            let endpoint = Arc::clone(self);
            std::thread::spawn(move || {
                if let Err(err) = endpoint.handle_connection(conn) {
                    log::warn!("subscription connection ended with error: {err}");
                }
            });
        }
        Ok(())
    }

    pub fn handle_connection(&self, mut conn: TcpStream) -> io::Result<()> {
        let mut reader = BufReader::new(conn.try_clone()?);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line)? == 0 {
            return Ok(());
        }
        let mut parts = request_line.trim_end().splitn(3, ' ');
        let method = parts.next().unwrap_or("").to_string();
        let target = parts.next().unwrap_or("").to_string();

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
                break;
            }
        }

        let (_path, query_str) = target.split_once('?').unwrap_or((target.as_str(), ""));
        if query_str.len() > self.config.max_query_bytes {
            return write_fixed(&mut conn, 400, "Bad Request", b"query too large\n", "text/plain");
        }

        let head_only = match method.as_str() {
            "GET" => false,
            "HEAD" => true,
            _ => return write_fixed(&mut conn, 405, "Method Not Allowed", b"", "text/plain"),
        };

        let query = match SubscriptionQuery::parse(query_str) {
            Ok(q) => q,
            Err(MalformedQuery(msg)) => {
                return write_fixed(&mut conn, 400, "Bad Request", msg.as_bytes(), "text/plain")
            }
        };

        if let Some(id) = query.terminate.clone() {
            self.registry.terminate(&id);
            return write_fixed(&mut conn, 200, "OK", b"", "text/plain");
        }

        if head_only {
            return write_size_headers_only(&mut conn, self.stream.size());
        }

        if query.sizeonly {
            let body = format!("{}\n", self.stream.size());
            return write_fixed(&mut conn, 200, "OK", body.as_bytes(), "application/json");
        }

        if let Some(lang) = &query.schema {
            let schema = match lang {
                None => Some(E::json_schema()),
                Some(lang) => E::json_schema_as(lang),
            };
            return match schema {
                Some(value) => {
                    let body = serde_json::to_vec_pretty(&value).unwrap_or_default();
                    write_fixed(&mut conn, 200, "OK", &body, "application/json")
                }
                None => write_fixed(&mut conn, 404, "Not Found", b"unknown schema language\n", "text/plain"),
            };
        }

        self.serve_tail(conn, query)
    }

    fn serve_tail(&self, mut conn: TcpStream, query: SubscriptionQuery) -> io::Result<()> {
        let size_at_start = self.stream.size();
        let start_cursor = query.start_cursor(size_at_start);
        let now_us = self.stream.now_us();
        let us_floor = query.us_floor(now_us);
        let subscription_id = random_id(self.config.subscription_id_len);

        write_chunked_headers(&mut conn, &subscription_id, size_at_start)?;

        let writer = Arc::new(Mutex::new(Some(ChunkedWriter::new(conn.try_clone()?))));
        let array = query.array;
        let entries_only = query.entries_only;
        let n_limit = query.n;
        let period = query.period_us;
        let stop_after_bytes = query.stop_after_bytes;

        if array {
            write_chunk(&writer, b"[\n");
        }

        let mut delivered = 0u64;
        let mut bytes_written = 0u64;
        let mut first_delivered_us: Option<i64> = None;
        let mut wrote_first = false;
        let writer_for_cb = Arc::clone(&writer);

        let options = SubscriberOptions::new(move |entry: &Entry<E>, idxts, _last| {
            if let Some(floor) = us_floor {
                if idxts.us < floor {
                    return CallbackResponse::More;
                }
            }
            let line = match format_entry_line(entry, entries_only) {
                Ok(line) => line,
                Err(_) => return CallbackResponse::Done,
            };
            let mut chunk = Vec::with_capacity(line.len() + 2);
            if array && wrote_first {
                chunk.extend_from_slice(b",\n");
            }
            chunk.extend_from_slice(line.as_bytes());
            if !write_chunk(&writer_for_cb, &chunk) {
                return CallbackResponse::Done;
            }
            wrote_first = true;
            bytes_written += chunk.len() as u64;
            delivered += 1;
            if first_delivered_us.is_none() {
                first_delivered_us = Some(idxts.us);
            }
            if n_limit.is_some_and(|n| delivered >= n) {
                return CallbackResponse::Done;
            }
            if let (Some(period), Some(first_us)) = (period, first_delivered_us) {
                if idxts.us >= first_us + period {
                    return CallbackResponse::Done;
                }
            }
            if stop_after_bytes.is_some_and(|limit| bytes_written >= limit) {
                return CallbackResponse::Done;
            }
            CallbackResponse::More
        })
        .with_start_cursor(start_cursor)
        .with_stop_when_caught_up(query.nowait);

        let scope = self
            .stream
            .subscribe_with_options(options)
            .map_err(to_io_error)?;
        self.registry.insert(subscription_id.clone(), scope.termination_handle());
        scope.join();
        self.registry.remove(&subscription_id);

        if array {
            write_chunk(&writer, b"]\n");
        }
        if let Some(w) = writer.lock().unwrap().take() {
            w.finish()?;
        }
        Ok(())
    }
}

fn format_entry_line<E: Serialize>(entry: &Entry<E>, entries_only: bool) -> Result<String, Error> {
    let payload_json =
        serde_json::to_string(&entry.payload).map_err(|e| Error::MalformedEntry(e.to_string()))?;
    if entries_only {
        Ok(format!("{payload_json}\n"))
    } else {
        let idxts_json =
            serde_json::to_string(&entry.idxts).map_err(|e| Error::MalformedEntry(e.to_string()))?;
        Ok(format!("{idxts_json}\t{payload_json}\n"))
    }
}

fn to_io_error(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn write_chunk(writer: &Arc<Mutex<Option<ChunkedWriter<TcpStream>>>>, bytes: &[u8]) -> bool {
    let mut guard = writer.lock().unwrap();
    match guard.as_mut() {
        Some(w) => w.write_all(bytes).is_ok(),
        None => false,
    }
}

/// Frames every `write`/`write_all` call as one HTTP chunk.
struct ChunkedWriter<W> {
    inner: W,
}

impl<W: Write> ChunkedWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }

    fn finish(mut self) -> io::Result<()> {
        self.inner.write_all(b"0\r\n\r\n")
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_chunked_headers(conn: &mut TcpStream, subscription_id: &str, size_at_start: u64) -> io::Result<()> {
    write!(
        conn,
        "HTTP/1.1 200 OK\r\n\
         Transfer-Encoding: chunked\r\n\
         Content-Type: application/json\r\n\
         Subscription-Id: {subscription_id}\r\n\
         Stream-Size: {size_at_start}\r\n\
         \r\n"
    )
}

fn write_fixed(
    conn: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &[u8],
    content_type: &str,
) -> io::Result<()> {
    write!(
        conn,
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         \r\n",
        body.len()
    )?;
    conn.write_all(body)
}

/// `HEAD`'s answer to `sizeonly`: the size conveyed entirely via the
/// `Stream-Size` header, with an empty body (`Content-Length: 0`), per
/// HTTP semantics forbidding a body on a HEAD response.
fn write_size_headers_only(conn: &mut TcpStream, size: u64) -> io::Result<()> {
    write!(
        conn,
        "HTTP/1.1 200 OK\r\n\
         Stream-Size: {size}\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
}

fn random_id(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}
