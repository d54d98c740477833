//! One-shot JPEG capture
//!
//! A snapshot is a single bounded response, so unlike the stream a failed
//! write is reported to the caller. The frame buffer goes back to the pool
//! before `handle` returns, whatever the outcome.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::capture::{CaptureError, FrameLease, FrameSource};
use crate::config::SnapshotConfig;
use crate::stream::mjpeg::JPEG_CONTENT_TYPE;
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("invalid frame: {len} bytes (accepted 1..={max})")]
    InvalidFrame { len: usize, max: usize },

    #[error("write failed: {0}")]
    Write(#[from] TransportError),
}

/// Counters exposed on the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub served: u64,
    pub failed: u64,
    pub stabilized: u64,
    pub stale_released: u64,
}

struct SnapshotState {
    last_request: Option<Instant>,
    retained: Option<FrameLease>,
}

/// Serves single captures with debounce and size validation.
///
/// Requests are handled one at a time; the camera is shared with any running
/// streams through the same [`FrameSource`].
pub struct SnapshotHandler {
    source: Arc<dyn FrameSource>,
    min_interval: Duration,
    stabilize_delay: Duration,
    max_frame_bytes: usize,
    state: Mutex<SnapshotState>,
    served: AtomicU64,
    failed: AtomicU64,
    stabilized: AtomicU64,
    stale_released: AtomicU64,
}

impl SnapshotHandler {
    pub fn new(source: Arc<dyn FrameSource>, config: &SnapshotConfig) -> Self {
        Self {
            source,
            min_interval: Duration::from_millis(config.min_interval_ms),
            stabilize_delay: Duration::from_millis(config.stabilize_delay_ms),
            max_frame_bytes: config.max_frame_bytes,
            state: Mutex::new(SnapshotState {
                last_request: None,
                retained: None,
            }),
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stabilized: AtomicU64::new(0),
            stale_released: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            served: self.served.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stabilized: self.stabilized.load(Ordering::Relaxed),
            stale_released: self.stale_released.load(Ordering::Relaxed),
        }
    }

    /// Captures one frame and sends it as a complete `image/jpeg` response.
    ///
    /// Returns the number of image bytes served.
    pub async fn handle<T>(&self, transport: &mut T) -> Result<usize, SnapshotError>
    where
        T: Transport + ?Sized,
    {
        let result = self.serve(transport).await;
        match &result {
            Ok(len) => {
                self.served.fetch_add(1, Ordering::Relaxed);
                info!("Snapshot served: {} bytes", len);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Snapshot failed: {}", e);
            }
        }
        result
    }

    async fn serve<T>(&self, transport: &mut T) -> Result<usize, SnapshotError>
    where
        T: Transport + ?Sized,
    {
        let mut state = self.state.lock().await;

        // Left behind when a previous request was cancelled mid-write
        if let Some(stale) = state.retained.take() {
            debug!("Releasing frame #{} retained by an earlier snapshot", stale.sequence());
            self.stale_released.fetch_add(1, Ordering::Relaxed);
            stale.release();
        }

        let now = Instant::now();
        let too_soon = state
            .last_request
            .map_or(false, |last| now.duration_since(last) < self.min_interval);
        state.last_request = Some(now);

        if too_soon && !self.stabilize_delay.is_zero() {
            debug!("Snapshot requested within {:?}, letting the sensor settle", self.min_interval);
            self.stabilized.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.stabilize_delay).await;
        }

        let lease = self.source.acquire().await?;
        let len = lease.len();
        if len == 0 || len > self.max_frame_bytes {
            lease.release();
            return Err(SnapshotError::InvalidFrame {
                len,
                max: self.max_frame_bytes,
            });
        }

        let lease = state.retained.insert(lease);
        let written = transport.send_response(lease.data(), JPEG_CONTENT_TYPE).await;

        if let Some(lease) = state.retained.take() {
            lease.release();
        }

        written?;
        Ok(len)
    }
}
