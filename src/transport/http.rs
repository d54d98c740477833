//! HTTP/1.1 responses written straight onto a connection

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Transport, TransportError};

const CORS_HEADER: (&str, &str) = ("Access-Control-Allow-Origin", "*");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Idle,
    Streaming,
    Done,
}

/// [`Transport`] over any async byte sink, normally a `TcpStream`.
///
/// Every response is `Connection: close`; a streamed body simply runs until
/// the connection goes away. With a send timeout set, a write or flush that
/// makes no progress for that long fails with [`TransportError::Timeout`].
pub struct HttpTransport<W> {
    stream: W,
    state: ResponseState,
    headers: Vec<(String, String)>,
    send_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin + Send> HttpTransport<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            state: ResponseState::Idle,
            headers: Vec::new(),
            send_timeout: None,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Adds a header to a successful response that has not been sent yet.
    /// Status responses carry only the CORS header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn into_inner(self) -> W {
        self.stream
    }

    fn head(
        &self,
        status: u16,
        reason: &str,
        content_type: &str,
        content_length: Option<usize>,
        with_headers: bool,
    ) -> String {
        let mut head = format!("HTTP/1.1 {} {}\r\nContent-Type: {}\r\n", status, reason, content_type);
        if let Some(len) = content_length {
            head.push_str(&format!("Content-Length: {}\r\n", len));
        }
        head.push_str(&format!("{}: {}\r\n", CORS_HEADER.0, CORS_HEADER.1));
        if with_headers {
            for (name, value) in &self.headers {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        head.push_str("Connection: close\r\n\r\n");
        head
    }

    async fn write_fully(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let limit = self.send_timeout;
        let mut written = 0;
        while written < bytes.len() {
            match bounded(limit, self.stream.write(&bytes[written..])).await? {
                0 => {
                    return Err(TransportError::ShortWrite {
                        written,
                        expected: bytes.len(),
                    })
                }
                n => written += n,
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let limit = self.send_timeout;
        bounded(limit, self.stream.flush()).await
    }

    fn expect_idle(&self) -> Result<(), TransportError> {
        match self.state {
            ResponseState::Idle => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    async fn send_complete(&mut self, head: String, body: &[u8]) -> Result<(), TransportError> {
        self.state = ResponseState::Done;
        self.write_fully(head.as_bytes()).await?;
        self.write_fully(body).await?;
        self.flush().await
    }
}

/// Runs one IO call, giving up after `limit` if one is set
async fn bounded<T>(
    limit: Option<Duration>,
    io: impl Future<Output = io::Result<T>>,
) -> Result<T, TransportError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, io).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout(limit)),
        },
        None => Ok(io.await?),
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for HttpTransport<W> {
    async fn begin_stream(&mut self, content_type: &str) -> Result<(), TransportError> {
        self.expect_idle()?;
        self.set_header("Cache-Control", "no-cache, no-store, must-revalidate");
        self.set_header("Pragma", "no-cache");

        let head = self.head(200, "OK", content_type, None, true);
        self.state = ResponseState::Streaming;
        if let Err(e) = self.write_fully(head.as_bytes()).await {
            self.state = ResponseState::Done;
            return Err(e);
        }
        if let Err(e) = self.flush().await {
            self.state = ResponseState::Done;
            return Err(e);
        }
        Ok(())
    }

    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.state != ResponseState::Streaming {
            return Err(TransportError::Closed);
        }
        if let Err(e) = self.write_fully(bytes).await {
            self.state = ResponseState::Done;
            return Err(e);
        }
        if let Err(e) = self.flush().await {
            self.state = ResponseState::Done;
            return Err(e);
        }
        Ok(())
    }

    async fn send_response(&mut self, body: &[u8], content_type: &str) -> Result<(), TransportError> {
        self.expect_idle()?;
        let head = self.head(200, "OK", content_type, Some(body.len()), true);
        self.send_complete(head, body).await
    }

    async fn send_status(&mut self, status: u16, reason: &str) -> Result<(), TransportError> {
        self.expect_idle()?;
        let body = format!("{} {}\n", status, reason);
        let head = self.head(status, reason, "text/plain; charset=utf-8", Some(body.len()), false);
        self.send_complete(head, body.as_bytes()).await
    }
}
