//! Camera-less frame source producing JPEG-shaped test frames

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CaptureError, FrameLease, FramePool, FrameSource, PoolStats};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Deterministic frames framed by JPEG start/end markers.
///
/// Used when no camera is attached, so the stream and snapshot paths can be
/// exercised end to end.
pub struct SyntheticSource {
    pool: FramePool,
    payload_len: usize,
    counter: AtomicU64,
}

impl SyntheticSource {
    pub fn new(pool: FramePool, payload_len: usize) -> Self {
        Self {
            pool,
            payload_len,
            counter: AtomicU64::new(0),
        }
    }

    fn render(&self, index: u64) -> Bytes {
        let label = format!("synthetic frame {}", index);
        let body_len = self.payload_len.max(label.len());

        let mut buf = BytesMut::with_capacity(body_len + JPEG_SOI.len() + JPEG_EOI.len());
        buf.put_slice(&JPEG_SOI);
        buf.put_slice(label.as_bytes());
        buf.put_bytes(0, body_len - label.len());
        buf.put_slice(&JPEG_EOI);
        buf.freeze()
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn acquire(&self) -> Result<FrameLease, CaptureError> {
        let slot = self.pool.checkout().await?;
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(slot.fill(self.render(index)))
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
