//! In-memory collaborators for exercising sessions and handlers without
//! camera or network hardware

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CaptureError, FrameLease, FramePool, FrameSource, PoolStats};
use crate::memory::MemoryProbe;
use crate::transport::{Transport, TransportError};

/// One scripted capture result
#[derive(Debug, Clone)]
pub enum CaptureStep {
    Frame(Bytes),
    Fail,
}

/// Frame source replaying a script of frames and failures.
///
/// Once the script runs out every capture returns the fallback frame.
pub struct ScriptedSource {
    pool: FramePool,
    script: Mutex<VecDeque<CaptureStep>>,
    fallback: Bytes,
    attempts: AtomicU64,
}

impl ScriptedSource {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            pool: FramePool::new(buffer_count, Duration::ZERO),
            script: Mutex::new(VecDeque::new()),
            fallback: Bytes::from_static(b"fakejpegdata"),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn push_frame(&self, frame: impl Into<Bytes>) {
        self.script.lock().push_back(CaptureStep::Frame(frame.into()));
    }

    pub fn push_failures(&self, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(CaptureStep::Fail);
        }
    }

    /// Calls to `acquire`, successful or not
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn acquire(&self) -> Result<FrameLease, CaptureError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| CaptureStep::Frame(self.fallback.clone()));

        match step {
            CaptureStep::Frame(data) => Ok(self.pool.checkout().await?.fill(data)),
            CaptureStep::Fail => Err(CaptureError::Device("scripted failure".to_string())),
        }
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Everything a [`RecordingTransport`] has been asked to send
#[derive(Debug, Default, Clone)]
pub struct TransportLog {
    pub stream_content_type: Option<String>,
    pub chunks: Vec<Bytes>,
    pub responses: Vec<(Bytes, String)>,
    pub statuses: Vec<u16>,
}

impl TransportLog {
    /// All streamed chunks concatenated
    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

/// Transport that records writes and can be told to fail.
///
/// Clones share the same log, so a test can keep a handle while a session
/// owns the transport.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `writes` more chunk/response writes succeed, then fails every one after.
    pub fn fail_after(&self, writes: usize) {
        *self.fail_after.lock() = Some(writes);
    }

    pub fn log(&self) -> TransportLog {
        self.log.lock().clone()
    }

    fn admit_write(&self) -> Result<(), TransportError> {
        let mut fail_after = self.fail_after.lock();
        match fail_after.as_mut() {
            Some(0) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client disconnected",
            ))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn begin_stream(&mut self, content_type: &str) -> Result<(), TransportError> {
        self.log.lock().stream_content_type = Some(content_type.to_string());
        Ok(())
    }

    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.admit_write()?;
        self.log.lock().chunks.push(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn send_response(&mut self, body: &[u8], content_type: &str) -> Result<(), TransportError> {
        self.admit_write()?;
        self.log
            .lock()
            .responses
            .push((Bytes::copy_from_slice(body), content_type.to_string()));
        Ok(())
    }

    async fn send_status(&mut self, status: u16, _reason: &str) -> Result<(), TransportError> {
        self.log.lock().statuses.push(status);
        Ok(())
    }
}

/// Memory probe returning a settable value
#[derive(Clone)]
pub struct FixedProbe {
    free: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl FixedProbe {
    pub fn new(free_bytes: u64) -> Self {
        Self {
            free: Arc::new(AtomicU64::new(free_bytes)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self, free_bytes: u64) {
        self.free.store(free_bytes, Ordering::Relaxed);
        self.failing.store(false, Ordering::Relaxed);
    }

    /// Makes every following read fail
    pub fn fail(&self) {
        self.failing.store(true, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedProbe {
    fn free_bytes(&self) -> io::Result<u64> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "probe unavailable"));
        }
        Ok(self.free.load(Ordering::Relaxed))
    }
}
