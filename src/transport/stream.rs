/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! A connected stream, plain or TLS, with the raw socket kept reachable.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, Interest, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// How long an idle stream may take to show pending input before we call it quiet
const READ_PROBE: Duration = Duration::from_millis(10);

/// Plain TCP or TLS-over-TCP
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// The underlying TCP socket
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(tls) => tls.get_ref().0,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Check that an idle stream can still be handed out.
    ///
    /// An idle stream must have nothing to read (no pushed data, no EOF, no
    /// error) and must become writable within `write_wait`. The read probe
    /// goes through the TLS layer so that post-handshake records such as
    /// session tickets are consumed instead of counting as pushed data.
    pub async fn is_idle_healthy(&mut self, write_wait: Duration) -> bool {
        match self.tcp().take_error() {
            Ok(None) => {}
            _ => return false,
        }

        let mut probe = [0u8; 1];
        if tokio::time::timeout(READ_PROBE, self.read(&mut probe))
            .await
            .is_ok()
        {
            return false;
        }

        match tokio::time::timeout(write_wait, self.tcp().ready(Interest::WRITABLE)).await {
            Ok(Ok(ready)) => ready.is_writable() && !ready.is_write_closed(),
            _ => false,
        }
    }
}

impl From<TcpStream> for Transport {
    fn from(tcp: TcpStream) -> Self {
        Transport::Plain(tcp)
    }
}

impl From<TlsStream<TcpStream>> for Transport {
    fn from(tls: TlsStream<TcpStream>) -> Self {
        Transport::Tls(Box::new(tls))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (Transport::from(client.unwrap()), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_quiet_stream_is_healthy() {
        let (mut client, _server) = pair().await;
        assert!(!client.is_tls());
        assert!(client.is_idle_healthy(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_closed_peer_is_unhealthy() {
        let (mut client, server) = pair().await;
        drop(server);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_idle_healthy(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_pushed_data_is_unhealthy() {
        let (mut client, mut server) = pair().await;
        server.write_all(b"unsolicited").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_idle_healthy(Duration::from_millis(200)).await);
    }
}
