//! Minimal HTTP/1.x front end: counts GETs and serves `/helloworld` and `/stats`.

use crate::counter::SlidingWindowCounter;
use crate::util::human::fmt_secs;
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_HEAD_BYTES: u64 = 8 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handles every connection needs.
#[derive(Clone)]
pub struct Gateway {
    counter: Arc<SlidingWindowCounter>,
    window_secs: u64,
    /// Deadline for receiving the request head, and again for sending the reply.
    io_timeout: Duration,
}

#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: u16,
    body: Value,
}

impl Gateway {
    pub fn new(counter: Arc<SlidingWindowCounter>, window_secs: u64) -> Self {
        Self { counter, window_secs, io_timeout: IO_TIMEOUT }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Accept connections until `shutdown` fires. Connections still open at
    /// that point are dropped as well.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("gateway stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a)  => a,
                        Err(e) => { warn!(error = %e, "accept failed"); continue; }
                    };
                    let gw = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => debug!(%peer, "dropping connection on shutdown"),
                            res = gw.handle(stream) => if let Err(e) = res {
                                debug!(%peer, error = %e, "connection error");
                            },
                        }
                    });
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream) -> io::Result<()> {
        let (read, mut write) = stream.into_split();

        let resp = match tokio::time::timeout(self.io_timeout, read_head(read)).await {
            Ok(head) => match parse_request_line(&head?) {
                Some((method, path)) => self.respond(method, path),
                None => Response { status: 400, body: json!({ "error": "bad request" }) },
            },
            Err(_) => Response { status: 408, body: json!({ "error": "request timeout" }) },
        };

        let reply = async {
            write.write_all(&encode_response(&resp)).await?;
            write.shutdown().await
        };
        tokio::time::timeout(self.io_timeout, reply)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client did not read the response"))?
    }

    fn respond(&self, method: &str, path: &str) -> Response {
        if method == "GET" {
            self.counter.increment();
        }
        let path = path.split('?').next().unwrap_or(path);
        match (method, path) {
            ("GET", "/helloworld") => Response {
                status: 200,
                body: json!({ "message": "hello world!" }),
            },
            ("GET", "/stats") => {
                let snap = self.counter.snapshot();
                Response {
                    status: 200,
                    body: json!({
                        "interval":        fmt_secs(self.window_secs),
                        "get_requests":    snap.total,
                        "window_requests": snap.window,
                        "pending":         snap.pending,
                        "timestamp":       chrono::Local::now().to_rfc3339(),
                    }),
                }
            }
            (_, "/helloworld") | (_, "/stats") => Response {
                status: 405,
                body: json!({ "error": "method not allowed" }),
            },
            _ => Response { status: 404, body: json!({ "error": "not found" }) },
        }
    }
}

/// Read the request line and drain the headers; bodies are never needed.
async fn read_head(read: OwnedReadHalf) -> io::Result<String> {
    let mut reader = BufReader::new(read.take(MAX_HEAD_BYTES));
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(request_line)
}

fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") || parts.next().is_some() {
        return None;
    }
    Some((method, path))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        _   => "Internal Server Error",
    }
}

fn encode_response(resp: &Response) -> Vec<u8> {
    let body = resp.body.to_string();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        resp.status,
        reason(resp.status),
        body.len()
    );
    if resp.status == 405 {
        out.push_str("Allow: GET\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&body);
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(cap: usize) -> Gateway {
        Gateway::new(Arc::new(SlidingWindowCounter::new(cap).unwrap()), 40)
    }

    #[test]
    fn request_line_parsing() {
        assert_eq!(parse_request_line("GET /stats HTTP/1.1\r\n"), Some(("GET", "/stats")));
        assert_eq!(parse_request_line("POST /x HTTP/1.0\r\n"), Some(("POST", "/x")));
        assert_eq!(parse_request_line("GET /stats\r\n"), None);
        assert_eq!(parse_request_line("GET /stats SPDY/3\r\n"), None);
        assert_eq!(parse_request_line(""), None);
    }

    #[test]
    fn every_get_is_counted_other_methods_are_not() {
        let gw = gateway(4);
        assert_eq!(gw.respond("GET", "/helloworld").status, 200);
        assert_eq!(gw.respond("GET", "/missing").status, 404);
        assert_eq!(gw.respond("POST", "/helloworld").status, 405);
        assert_eq!(gw.respond("DELETE", "/nowhere").status, 404);
        assert_eq!(gw.counter.snapshot().pending, 2);
    }

    #[test]
    fn stats_reports_rotated_total() {
        let gw = gateway(4);
        gw.respond("GET", "/helloworld");
        gw.respond("GET", "/helloworld");
        gw.counter.rotate();
        let resp = gw.respond("GET", "/stats?verbose=1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["interval"], "40s");
        assert_eq!(resp.body["get_requests"], 2);
        // the /stats GET itself is in the new current slot
        assert_eq!(resp.body["pending"], 1);
        assert_eq!(resp.body["window_requests"], 3);
    }

    #[test]
    fn response_encoding() {
        let bytes = encode_response(&Response { status: 405, body: json!({ "error": "method not allowed" }) });
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("Allow: GET\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"error\":\"method not allowed\"}"));
    }

    async fn send(addr: std::net::SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_over_tcp_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gw = gateway(60);
        let counter = Arc::clone(&gw.counter);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(gw.serve(listener, shutdown.clone()));

        let hello = send(addr, "GET /helloworld HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(hello.starts_with("HTTP/1.1 200 OK"));
        assert!(hello.ends_with("{\"message\":\"hello world!\"}"));

        let post = send(addr, "POST /helloworld HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
        assert!(post.starts_with("HTTP/1.1 405"));

        let bad = send(addr, "garbage\r\n\r\n").await;
        assert!(bad.starts_with("HTTP/1.1 400"));

        assert_eq!(counter.snapshot().pending, 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_connection_gets_408_and_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gw = gateway(4).with_io_timeout(Duration::from_millis(200));
        let counter = Arc::clone(&gw.counter);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(gw.serve(listener, shutdown.clone()));

        let mut idle = TcpStream::connect(addr).await.unwrap();
        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), idle.read_to_string(&mut out))
            .await
            .expect("idle connection was never closed")
            .unwrap();
        assert!(out.starts_with("HTTP/1.1 408 Request Timeout"));
        assert_eq!(counter.snapshot().pending, 0);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_open_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gw = gateway(4).with_io_timeout(Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(gw.serve(listener, shutdown.clone()));

        let mut idle = TcpStream::connect(addr).await.unwrap();
        // let the gateway pick the connection up
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let mut buf = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut buf)).await;
        assert!(closed.is_ok(), "connection still open after shutdown");
        assert!(buf.is_empty());
    }
}
