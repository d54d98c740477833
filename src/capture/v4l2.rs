//! V4L2 MJPEG capture

use async_trait::async_trait;
use bytes::Bytes;
use log::{error, info};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use v4l::{
    buffer::Type,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::Capture,
    Device, FourCC,
};

use super::{CaptureError, FrameLease, FramePool, FrameSource, PoolStats};
use crate::config::CameraConfig;

/// Camera source backed by a V4L2 device delivering MJPEG.
///
/// The device is drained on its own thread, which keeps only the most recent
/// frame; `acquire` waits for a frame newer than the last one handed out.
pub struct V4l2Source {
    pool: FramePool,
    frames: Mutex<watch::Receiver<Option<Bytes>>>,
    running: Arc<AtomicBool>,
    wait: Duration,
}

impl V4l2Source {
    /// Opens the device and starts the capture thread.
    pub fn open(pool: FramePool, config: &CameraConfig) -> Result<Self, CaptureError> {
        let (frame_tx, frame_rx) = watch::channel(None);
        let running = Arc::new(AtomicBool::new(true));

        let thread_config = config.clone();
        let thread_running = Arc::clone(&running);
        thread::Builder::new()
            .name("v4l2-capture".to_string())
            .spawn(move || {
                if let Err(e) = capture_loop(&thread_config, &frame_tx, &thread_running) {
                    error!("Capture thread for {} stopped: {}", thread_config.device, e);
                }
                thread_running.store(false, Ordering::Relaxed);
            })
            .map_err(|e| CaptureError::Device(format!("spawn capture thread: {}", e)))?;

        Ok(Self {
            pool,
            frames: Mutex::new(frame_rx),
            running,
            wait: config.acquire_timeout(),
        })
    }
}

fn capture_loop(
    config: &CameraConfig,
    frame_tx: &watch::Sender<Option<Bytes>>,
    running: &AtomicBool,
) -> io::Result<()> {
    let mut device = Device::with_path(&config.device)?;

    let mut fmt = device.format()?;
    fmt.width = config.width;
    fmt.height = config.height;
    fmt.fourcc = FourCC::new(b"MJPG");
    let fmt = device.set_format(&fmt)?;
    info!("Camera format set for {}: {}", config.device, fmt);

    if fmt.fourcc != FourCC::new(b"MJPG") {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} does not deliver MJPEG (got {})", config.device, fmt.fourcc),
        ));
    }

    let mut stream =
        MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count as u32)?;

    while running.load(Ordering::Relaxed) {
        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        frame_tx.send_replace(Some(Bytes::copy_from_slice(&buf[..used])));
    }

    Ok(())
}

#[async_trait]
impl FrameSource for V4l2Source {
    async fn acquire(&self) -> Result<FrameLease, CaptureError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(CaptureError::Device("capture thread not running".to_string()));
        }

        let slot = self.pool.checkout().await?;

        let mut frames = self.frames.lock().await;
        match tokio::time::timeout(self.wait, frames.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(CaptureError::Device("capture thread exited".to_string())),
            Err(_) => return Err(CaptureError::NoFrame),
        }

        let data = frames.borrow_and_update().clone().ok_or(CaptureError::NoFrame)?;
        Ok(slot.fill(data))
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
