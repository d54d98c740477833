//! Response transport used by stream sessions and snapshots

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Write failures. A failed write leaves the connection in an unknown state,
/// so callers never resume after one.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("client stalled, write timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,
}

/// The HTTP response primitive a handler writes framed bytes into
#[async_trait]
pub trait Transport: Send {
    /// Sends the response head of an open-ended body written with `write_chunk`.
    async fn begin_stream(&mut self, content_type: &str) -> Result<(), TransportError>;

    /// Writes one piece of an open-ended body.
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Sends a complete response with the given body.
    async fn send_response(&mut self, body: &[u8], content_type: &str) -> Result<(), TransportError>;

    /// Sends a bodiless status response such as `500 Internal Server Error`.
    async fn send_status(&mut self, status: u16, reason: &str) -> Result<(), TransportError>;
}
