//! Frame capture: the bounded frame pool and the sources that fill it

mod pool;
mod synthetic;
#[cfg(feature = "camera-v4l")]
mod v4l2;

pub use pool::{FrameLease, FramePool, PoolSlot, PoolStats};
pub use synthetic::SyntheticSource;
#[cfg(feature = "camera-v4l")]
pub use v4l2::V4l2Source;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Capture failures. Every variant is transient from the stream's point of view.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no free frame buffer (pool of {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("timed out after {0:?} waiting for a frame buffer")]
    Timeout(Duration),

    #[error("camera has no frame ready")]
    NoFrame,

    #[error("camera error: {0}")]
    Device(String),
}

/// Produces encoded frames on demand.
///
/// Implementations draw their buffers from a [`FramePool`], so the pool's
/// capacity bounds the number of leases outstanding at any instant, across
/// every caller sharing the source.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Captures one frame and hands out an exclusive lease on it.
    async fn acquire(&self) -> Result<FrameLease, CaptureError>;

    /// Snapshot of the backing pool's counters.
    fn pool_stats(&self) -> PoolStats;
}
