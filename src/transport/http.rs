/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! HTTP/1.1 exchange over a raced connection.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::warn;
use url::Url;

use super::race::{ConnectRequest, Connected, RaceConnector};
use super::stream::Transport;
use crate::error::{Phase, TransportError, TransportResult};

/// Largest response head we are willing to buffer
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Request to send
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    /// Path plus query
    pub path: String,
    pub tls: bool,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cache_key: String,
    pub timeout: Duration,
    pub range_fetch: bool,
}

impl HttpRequest {
    pub fn from_url(method: &str, url: &Url) -> TransportResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::protocol(format!("no host in {}", url)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::protocol(format!("no port for {}", url)))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            method: method.to_string(),
            cache_key: format!("{}:{}", host, port),
            host,
            port,
            path,
            tls: url.scheme() == "https",
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: Duration::from_secs(8),
            range_fetch: false,
        })
    }

    /// Add or replace a header
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn connect_request(&self) -> ConnectRequest {
        ConnectRequest::new(self.host.clone(), self.port, self.cache_key.clone())
            .tls(self.tls)
            .timeout(self.timeout)
            .range_fetch(self.range_fetch)
    }

    fn encode_head(&self) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        if find_header(&self.headers, "Host").is_none() {
            let default_port = if self.tls { 443 } else { 80 };
            if self.port == default_port {
                head.push_str(&format!("Host: {}\r\n", self.host));
            } else {
                head.push_str(&format!("Host: {}:{}\r\n", self.host, self.port));
            }
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() && find_header(&self.headers, "Content-Length").is_none() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Response whose body is still on the wire
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub peer: SocketAddr,
    pub body: ResponseBody,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Longest chunk-size or trailer line we accept
const MAX_CHUNK_LINE: usize = 4096;

/// Where the body stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Content-Length, bytes still expected
    Length(u64),
    Chunked(ChunkState),
    /// Runs until the peer closes
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    /// CRLF closing a chunk
    DataEnd,
    Trailer,
    Done,
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    u64::from_str_radix(size, 16).ok()
}

fn bad_chunk(peer: SocketAddr, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("chunked body from {}: {}", peer, what),
    )
}

/// Body reader honouring Content-Length or chunked framing
pub struct ResponseBody {
    stream: Transport,
    peer: SocketAddr,
    leftover: BytesMut,
    framing: Framing,
    keep_alive: bool,
}

impl ResponseBody {
    fn finished(&self) -> bool {
        matches!(
            self.framing,
            Framing::Length(0) | Framing::Chunked(ChunkState::Done)
        )
    }

    /// The connection, if the body was fully read and the peer allows reuse
    pub fn into_reusable(self) -> Option<(Transport, SocketAddr)> {
        if self.keep_alive && self.finished() && self.leftover.is_empty() {
            Some((self.stream, self.peer))
        } else {
            None
        }
    }

    /// Append whatever the socket has to `leftover`; EOF is an error here
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut scratch = [0u8; 8192];
        let mut filled = ReadBuf::new(&mut scratch);
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut filled))?;
        if filled.filled().is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunked body from {} ended early", self.peer),
            )));
        }
        self.leftover.extend_from_slice(filled.filled());
        Poll::Ready(Ok(()))
    }

    fn poll_chunked(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let Framing::Chunked(state) = self.framing else {
                return Poll::Ready(Ok(()));
            };
            match state {
                ChunkState::Done => return Poll::Ready(Ok(())),
                ChunkState::Data(left) => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    if self.leftover.is_empty() {
                        ready!(self.poll_fill(cx))?;
                        continue;
                    }
                    let n = (left.min(buf.remaining() as u64) as usize).min(self.leftover.len());
                    buf.put_slice(&self.leftover.split_to(n));
                    let left = left - n as u64;
                    self.framing = Framing::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Poll::Ready(Ok(()));
                }
                ChunkState::Size | ChunkState::DataEnd | ChunkState::Trailer => {
                    let Some(pos) = self.leftover.windows(2).position(|w| w == b"\r\n") else {
                        if self.leftover.len() > MAX_CHUNK_LINE {
                            return Poll::Ready(Err(bad_chunk(self.peer, "line too long")));
                        }
                        ready!(self.poll_fill(cx))?;
                        continue;
                    };
                    let line = self.leftover.split_to(pos + 2);
                    let line = &line[..pos];
                    let next = match state {
                        ChunkState::Size => match parse_chunk_size(line) {
                            Some(0) => ChunkState::Trailer,
                            Some(size) => ChunkState::Data(size),
                            None => return Poll::Ready(Err(bad_chunk(self.peer, "bad chunk size"))),
                        },
                        ChunkState::DataEnd if line.is_empty() => ChunkState::Size,
                        ChunkState::DataEnd => {
                            return Poll::Ready(Err(bad_chunk(self.peer, "chunk overruns its size")))
                        }
                        _ if line.is_empty() => ChunkState::Done,
                        _ => ChunkState::Trailer,
                    };
                    self.framing = Framing::Chunked(next);
                }
            }
        }
    }

    fn poll_plain(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let limit = match self.framing {
            Framing::Length(0) => return Poll::Ready(Ok(())),
            Framing::Length(left) => left.min(buf.remaining() as u64) as usize,
            _ => buf.remaining(),
        };

        let read = if !self.leftover.is_empty() {
            let n = limit.min(self.leftover.len());
            buf.put_slice(&self.leftover.split_to(n));
            n
        } else if limit == buf.remaining() {
            let before = buf.filled().len();
            ready!(Pin::new(&mut self.stream).poll_read(cx, buf))?;
            buf.filled().len() - before
        } else {
            let mut scratch = vec![0u8; limit];
            let mut limited = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut self.stream).poll_read(cx, &mut limited))?;
            buf.put_slice(limited.filled());
            limited.filled().len()
        };

        if let Framing::Length(left) = &mut self.framing {
            if read == 0 && limit > 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body from {} ended {} bytes early", self.peer, left),
                )));
            }
            *left -= read as u64;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.framing {
            Framing::Chunked(_) => this.poll_chunked(cx, buf),
            _ => this.poll_plain(cx, buf),
        }
    }
}

struct Head {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    leftover: BytesMut,
}

async fn read_head(stream: &mut Transport, peer: SocketAddr, wait: Duration) -> TransportResult<Head> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = tokio::time::timeout(wait, stream.read_buf(&mut buf))
            .await
            .map_err(|_| TransportError::timeout(peer, Phase::Read))?
            .map_err(|e| TransportError::connect(peer, e))?;
        if n == 0 {
            return Err(TransportError::connect(
                peer,
                io::Error::new(io::ErrorKind::UnexpectedEof, "closed before response head"),
            ));
        }

        let parsed = {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut slots);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(len)) => Some((
                    len,
                    response.code.unwrap_or(0),
                    response.reason.unwrap_or("").to_string(),
                    response
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect::<Vec<_>>(),
                )),
                Ok(httparse::Status::Partial) => None,
                Err(e) => {
                    return Err(TransportError::protocol(format!(
                        "malformed response from {}: {}",
                        peer, e
                    )))
                }
            }
        };

        match parsed {
            Some((len, status, reason, headers)) => {
                let leftover = buf.split_off(len);
                return Ok(Head {
                    status,
                    reason,
                    headers,
                    leftover,
                });
            }
            None if buf.len() > MAX_HEAD_BYTES => {
                return Err(TransportError::protocol(format!(
                    "response head from {} exceeds {} bytes",
                    peer, MAX_HEAD_BYTES
                )))
            }
            None => {}
        }
    }
}

async fn exchange(mut conn: Connected, req: &HttpRequest) -> TransportResult<HttpResponse> {
    let peer = conn.peer;
    let head = req.encode_head();
    let send = async {
        conn.stream.write_all(&head).await?;
        if !req.body.is_empty() {
            conn.stream.write_all(&req.body).await?;
        }
        conn.stream.flush().await
    };
    tokio::time::timeout(conn.timeout, send)
        .await
        .map_err(|_| TransportError::timeout(peer, Phase::Read))?
        .map_err(|e| TransportError::connect(peer, e))?;

    let head = read_head(&mut conn.stream, peer, conn.timeout).await?;

    let chunked = find_header(&head.headers, "Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    let framing = if req.method.eq_ignore_ascii_case("HEAD")
        || head.status == 204
        || head.status == 304
    {
        Framing::Length(0)
    } else if chunked {
        Framing::Chunked(ChunkState::Size)
    } else {
        match find_header(&head.headers, "Content-Length").map(|len| len.trim().parse()) {
            Some(Ok(len)) => Framing::Length(len),
            Some(Err(_)) => {
                return Err(TransportError::protocol(format!(
                    "bad Content-Length from {}",
                    peer
                )))
            }
            None => Framing::Close,
        }
    };
    let close = find_header(&head.headers, "Connection")
        .is_some_and(|c| c.eq_ignore_ascii_case("close"));

    Ok(HttpResponse {
        status: head.status,
        reason: head.reason,
        headers: head.headers,
        peer,
        body: ResponseBody {
            stream: conn.stream,
            peer,
            leftover: head.leftover,
            framing,
            keep_alive: !close && framing != Framing::Close,
        },
    })
}

/// Sends requests over raced connections, retrying on failure
pub struct HttpClient {
    connector: Arc<RaceConnector>,
    max_retry: usize,
}

impl HttpClient {
    pub fn new(connector: Arc<RaceConnector>, max_retry: usize) -> Self {
        Self {
            connector,
            max_retry: max_retry.max(1),
        }
    }

    pub fn connector(&self) -> &Arc<RaceConnector> {
        &self.connector
    }

    pub async fn request(&self, req: &HttpRequest) -> TransportResult<HttpResponse> {
        let connect = req.connect_request();
        let mut last_error = None;

        for attempt in 1..=self.max_retry {
            let conn = match self.connector.connect(&connect).await {
                Ok(conn) => conn,
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("connect for {} failed (attempt {}): {}", req.host, attempt, e);
                    last_error = Some(e);
                    continue;
                }
            };
            let peer = conn.peer;
            let reused = conn.reused;

            match exchange(conn, req).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        "{} {} via {} failed (attempt {}): {}",
                        req.method, req.path, peer, attempt, e
                    );
                    if req.range_fetch {
                        self.connector.penalize(peer, req.tls);
                    } else if !e.is_retryable() || (e.is_reset() && !reused) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Resolve {
            host: req.host.clone(),
        }))
    }

    /// Park the connection of a fully read response
    pub fn recycle(&self, cache_key: &str, body: ResponseBody) -> bool {
        match body.into_reusable() {
            Some((stream, peer)) => {
                self.connector.pool(stream.is_tls()).checkin(cache_key, stream, peer);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::transport::testing::{connector_with, loopback, test_connector};
    use crate::transport::Resolver;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Answer every request on every connection with `reply`, handing the
    /// received heads to the test.
    fn serve(listener: TcpListener, reply: &'static [u8]) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        seen.extend_from_slice(&chunk[..n]);
                        if let Some(end) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head: Vec<u8> = seen.drain(..end + 4).collect();
                            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
                            if sock.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        rx
    }

    fn request(port: u16) -> HttpRequest {
        let url = Url::parse(&format!("http://upstream.test:{}/file.bin?x=1", port)).unwrap();
        HttpRequest::from_url("GET", &url)
            .unwrap()
            .header("Range", "bytes=0-4")
    }

    #[test]
    fn test_request_head_encoding() {
        let url = Url::parse("https://example.org/a?b=c").unwrap();
        let req = HttpRequest::from_url("POST", &url).unwrap();
        let req = HttpRequest {
            body: Bytes::from_static(b"payload"),
            ..req
        };
        let head = String::from_utf8(req.encode_head()).unwrap();
        assert!(head.starts_with("POST /a?b=c HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.org\r\n"));
        assert!(head.contains("Content-Length: 7\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(req.cache_key, "example.org:443");
        assert!(req.tls);
    }

    #[tokio::test]
    async fn test_partial_response_is_framed_and_reusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut heads = serve(
            listener,
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-4/10\r\nContent-Length: 5\r\n\r\nhello",
        );

        let client = HttpClient::new(Arc::new(test_connector(vec![loopback(1)], 4)), 2);
        let req = request(port);
        let mut response = client.request(&req).await.unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.reason, "Partial Content");
        assert_eq!(response.header("content-range"), Some("bytes 0-4/10"));

        let mut body = Vec::new();
        response.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");

        let sent = heads.recv().await.unwrap();
        assert!(sent.starts_with("GET /file.bin?x=1 HTTP/1.1\r\n"));
        assert!(sent.contains(&format!("Host: upstream.test:{}\r\n", port)));
        assert!(sent.contains("Range: bytes=0-4\r\n"));

        assert!(client.recycle(&req.cache_key, response.body));
        let again = client.request(&req).await.unwrap();
        assert_eq!(again.status, 206);
    }

    #[tokio::test]
    async fn test_connection_close_is_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _heads = serve(
            listener,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
        );

        let client = HttpClient::new(Arc::new(test_connector(vec![loopback(1)], 4)), 1);
        let req = request(port);
        let mut response = client.request(&req).await.unwrap();
        let mut body = Vec::new();
        response.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"ok");
        assert!(!client.recycle(&req.cache_key, response.body));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut chunk = [0u8; 1024];
                let _ = sock.read(&mut chunk).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort")
                    .await;
            }
        });

        let client = HttpClient::new(Arc::new(test_connector(vec![loopback(1)], 4)), 1);
        let mut response = client.request(&request(port)).await.unwrap();
        let mut body = Vec::new();
        let err = response.body.read_to_end(&mut body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_chunked_body_is_decoded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _heads = serve(
            listener,
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-4/5\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );

        let client = HttpClient::new(Arc::new(test_connector(vec![loopback(1)], 4)), 1);
        let req = request(port);
        let mut response = client.request(&req).await.unwrap();
        let mut body = Vec::new();
        response.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
        assert!(client.recycle(&req.cache_key, response.body));
    }

    #[tokio::test]
    async fn test_chunk_extensions_and_trailers_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _heads = serve(
            listener,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3;name=x\r\nhel\r\nA\r\nlo, world!\r\n0\r\nX-Checksum: 1\r\n\r\n",
        );

        let client = HttpClient::new(Arc::new(test_connector(vec![loopback(1)], 4)), 1);
        let mut response = client.request(&request(port)).await.unwrap();
        // small reads cross chunk boundaries
        let mut body = Vec::new();
        let mut small = [0u8; 4];
        loop {
            let n = response.body.read(&mut small).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&small[..n]);
        }
        assert_eq!(body, b"hello, world!");
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _heads = serve(
            listener,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhello\r\n0\r\n\r\n",
        );

        let client = HttpClient::new(Arc::new(test_connector(vec![loopback(1)], 4)), 1);
        let req = request(port);
        let mut response = client.request(&req).await.unwrap();
        let mut body = Vec::new();
        let err = response.body.read_to_end(&mut body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!client.recycle(&req.cache_key, response.body));
    }

    struct CountingResolver {
        ips: Vec<IpAddr>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve(&self, _host: &str) -> TransportResult<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ips.clone())
        }
    }

    #[tokio::test]
    async fn test_exhausted_connect_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let resolver = Arc::new(CountingResolver {
            ips: vec![loopback(1)],
            calls: AtomicUsize::new(0),
        });
        let connector = connector_with(&LinkConfig::default(), resolver.clone());
        let client = HttpClient::new(Arc::new(connector), 3);

        let err = client.request(&request(port)).await.unwrap_err();
        assert!(matches!(err, TransportError::Exhausted { .. }));
        assert!(!err.is_retryable());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }
}
