//! `multipart/x-mixed-replace` framing
//!
//! Each frame goes out as
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <len>\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! No closing boundary is ever sent; the stream ends when the connection does.

use bytes::{BufMut, Bytes, BytesMut};

use crate::transport::{Transport, TransportError};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

const PART_TRAILER: &[u8] = b"\r\n";

/// Content type of the whole streaming response
pub fn stream_content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={}", boundary)
}

/// Boundary line and part headers preceding a frame of `len` bytes
pub fn part_header(boundary: &str, len: usize) -> String {
    format!(
        "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        boundary, JPEG_CONTENT_TYPE, len
    )
}

/// A whole part in one buffer
pub fn encode_part(boundary: &str, payload: &[u8]) -> Bytes {
    let header = part_header(boundary, payload.len());
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + PART_TRAILER.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(PART_TRAILER);
    buf.freeze()
}

/// Writes one part without copying the payload.
///
/// Returns the number of bytes put on the wire.
pub async fn write_part<T>(transport: &mut T, boundary: &str, payload: &[u8]) -> Result<usize, TransportError>
where
    T: Transport + ?Sized,
{
    let header = part_header(boundary, payload.len());
    transport.write_chunk(header.as_bytes()).await?;
    transport.write_chunk(payload).await?;
    transport.write_chunk(PART_TRAILER).await?;
    Ok(header.len() + payload.len() + PART_TRAILER.len())
}
