/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Sub-fetch collaborator used by the range engine.

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use url::Url;

use crate::error::TransportResult;
use crate::transport::{HttpClient, HttpRequest, ResponseBody};

/// Headers never forwarded on a sub-fetch
const HOP_HEADERS: &[&str] = &["Range", "Host", "Connection", "Content-Length"];

/// One ranged request
#[derive(Debug, Clone)]
pub struct SubFetch {
    pub url: Url,
    pub start: u64,
    pub end: u64,
    /// Slot that gates this request
    pub slot: String,
    pub headers: Vec<(String, String)>,
}

/// Body of a sub-fetch response
pub enum RangeBody {
    /// Still on a pooled-capable connection
    Wire(ResponseBody),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl AsyncRead for RangeBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RangeBody::Wire(body) => Pin::new(body).poll_read(cx, buf),
            RangeBody::Reader(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

pub struct RangeResponse {
    pub status: u16,
    /// Status reported by an application layer in front of the origin, if any
    pub app_status: Option<u16>,
    pub headers: Vec<(String, String)>,
    /// Front-end IP that served the response
    pub peer: Option<IpAddr>,
    pub body: RangeBody,
}

impl RangeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_range(&self) -> Option<(u64, u64, u64)> {
        self.header("Content-Range").and_then(parse_content_range)
    }
}

/// Parse `bytes start-end/length`
pub fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, length) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    let length: u64 = length.trim().parse().ok()?;
    (start <= end && end < length).then_some((start, end, length))
}

/// Issues sub-fetches for the range engine
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn fetch(&self, request: &SubFetch) -> TransportResult<RangeResponse>;

    /// Whether responses come from the trusted IP pool, so their peer can be
    /// checked against it
    fn uses_ip_pool(&self) -> bool {
        false
    }

    /// Hand back a fully read response
    fn release(&self, _request: &SubFetch, _response: RangeResponse) {}
}

/// Sub-fetches over the raced HTTP client
pub struct HttpRangeSource {
    http: Arc<HttpClient>,
    timeout: Duration,
    pooled: bool,
    cache_key: Option<String>,
}

impl HttpRangeSource {
    /// `pooled` tells whether the client resolves hosts through the IP pool
    pub fn new(http: Arc<HttpClient>, timeout: Duration, pooled: bool) -> Self {
        Self {
            http,
            timeout,
            pooled,
            cache_key: None,
        }
    }

    /// Pool connections under `key` instead of `host:port`
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    fn request(&self, sub: &SubFetch) -> TransportResult<HttpRequest> {
        let mut req = HttpRequest::from_url("GET", &sub.url)?;
        for (name, value) in &sub.headers {
            if !HOP_HEADERS.iter().any(|hop| hop.eq_ignore_ascii_case(name)) {
                req.headers.push((name.clone(), value.clone()));
            }
        }
        if let Some(key) = &self.cache_key {
            req.cache_key = key.clone();
        }
        req.timeout = self.timeout;
        req.range_fetch = true;
        Ok(req.header("Range", format!("bytes={}-{}", sub.start, sub.end)))
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn fetch(&self, request: &SubFetch) -> TransportResult<RangeResponse> {
        let req = self.request(request)?;
        let response = self.http.request(&req).await?;
        Ok(RangeResponse {
            status: response.status,
            app_status: None,
            headers: response.headers,
            peer: Some(response.peer.ip()),
            body: RangeBody::Wire(response.body),
        })
    }

    fn uses_ip_pool(&self) -> bool {
        self.pooled
    }

    fn release(&self, request: &SubFetch, response: RangeResponse) {
        if let (RangeBody::Wire(body), Ok(req)) = (response.body, self.request(request)) {
            self.http.recycle(&req.cache_key, body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{loopback, test_connector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-99/1000"), Some((0, 99, 1000)));
        assert_eq!(parse_content_range("bytes  5-5/6"), Some((5, 5, 6)));
        assert_eq!(parse_content_range("bytes 10-5/100"), None);
        assert_eq!(parse_content_range("bytes 0-99/*"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[tokio::test]
    async fn test_http_source_sends_range_and_recycles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut seen = Vec::new();
                let mut chunk = [0u8; 1024];
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&seen).into_owned());
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 10-13/100\r\nContent-Length: 4\r\n\r\nabcd",
                    )
                    .await;
                // keep the connection open for reuse
                let _ = sock.read(&mut chunk).await;
            }
        });

        let connector = Arc::new(test_connector(vec![loopback(1)], 4));
        let http = Arc::new(HttpClient::new(connector.clone(), 1));
        let source = HttpRangeSource::new(http, Duration::from_secs(2), false);
        let sub = SubFetch {
            url: Url::parse(&format!("http://upstream.test:{}/big.iso", port)).unwrap(),
            start: 10,
            end: 13,
            slot: "slot-1".to_string(),
            headers: vec![
                ("Range".to_string(), "bytes=0-".to_string()),
                ("User-Agent".to_string(), "test".to_string()),
            ],
        };

        let mut response = source.fetch(&sub).await.unwrap();
        assert_eq!(response.content_range(), Some((10, 13, 100)));
        assert_eq!(response.peer, Some(loopback(1)));
        let mut body = Vec::new();
        response.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"abcd");

        let sent = rx.recv().await.unwrap();
        assert!(sent.contains("Range: bytes=10-13\r\n"));
        assert!(!sent.contains("bytes=0-"));
        assert!(sent.contains("User-Agent: test\r\n"));

        source.release(&sub, response);
        let key = format!("upstream.test:{}", port);
        assert_eq!(connector.pool(false).idle_count(&key), 1);
    }
}
