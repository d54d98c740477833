//! The capture, transmit, release loop behind one streaming connection

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::mjpeg;
use super::stats::SessionStats;
use crate::capture::{FrameLease, FrameSource};
use crate::memory::{MemoryLevel, MemoryWatchdog};
use crate::schedule::{Scheduler, SchedulingPoint};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    Terminated,
}

/// Why a session stopped
#[derive(Debug)]
pub enum TerminationReason {
    /// The client went away mid-stream. Never retried.
    WriteFailed(TransportError),

    /// Process shutdown was signalled
    Shutdown,

    /// [`StreamSession::stop`] was called
    Stopped,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            TerminationReason::Shutdown => write!(f, "shutdown"),
            TerminationReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A frame went out; `bytes` includes the part framing
    FrameSent { bytes: usize },

    /// Capture failed, the session backed off and stays streaming
    CaptureRetry,

    /// The session is (now) terminated
    Terminated,
}

/// Summary handed back when a session ends
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub stats: SessionStats,
    pub reason: TerminationReason,
    pub duration: Duration,
}

impl SessionReport {
    pub fn fps(&self) -> f64 {
        self.stats.calculate_fps(self.duration.as_secs_f64())
    }
}

/// One long-lived streaming connection.
///
/// States go `Streaming -> Terminated` and never back. A capture failure is
/// transient and only costs a backoff; a write failure ends the session.
/// Frames go out in acquisition order and every acquired lease is released
/// before the next acquire.
pub struct StreamSession<T> {
    id: u64,
    transport: T,
    source: Arc<dyn FrameSource>,
    watchdog: Arc<MemoryWatchdog>,
    scheduler: Scheduler,
    boundary: String,
    state: SessionState,
    held: Option<FrameLease>,
    stats: SessionStats,
    last_memory_check: Instant,
    last_yield_frame: u64,
    started: Instant,
    shutdown: Option<watch::Receiver<bool>>,
    reason: Option<TerminationReason>,
}

impl<T: Transport> StreamSession<T> {
    pub fn new(
        id: u64,
        transport: T,
        source: Arc<dyn FrameSource>,
        watchdog: Arc<MemoryWatchdog>,
        scheduler: Scheduler,
        boundary: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            source,
            watchdog,
            scheduler,
            boundary: boundary.into(),
            state: SessionState::Streaming,
            held: None,
            stats: SessionStats::default(),
            last_memory_check: now,
            last_yield_frame: 0,
            started: now,
            shutdown: None,
            reason: None,
        }
    }

    /// Ends the session at the top of the next iteration once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn frames_sent(&self) -> u64 {
        self.stats.frames_sent
    }

    /// Frame count at the most recent fairness yield
    pub fn last_yield_frame(&self) -> u64 {
        self.last_yield_frame
    }

    pub fn is_holding_frame(&self) -> bool {
        self.held.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Forces the session into `Terminated`. Any held lease is released.
    pub fn stop(&mut self) {
        if let Some(lease) = self.held.take() {
            lease.release();
        }
        self.terminate(TerminationReason::Stopped);
    }

    /// Runs one iteration of the loop.
    pub async fn step(&mut self) -> StepOutcome {
        if self.state == SessionState::Terminated {
            return StepOutcome::Terminated;
        }

        if self.shutdown_requested() {
            self.terminate(TerminationReason::Shutdown);
            return StepOutcome::Terminated;
        }

        if let Some(stale) = self.held.take() {
            warn!("Session {}: releasing frame #{} left over from the last iteration", self.id, stale.sequence());
            self.stats.stale_leases_released += 1;
            stale.release();
        }

        let lease = match self.source.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                self.stats.capture_failures += 1;
                warn!("Session {}: capture failed, retrying: {}", self.id, e);
                self.scheduler.suspend(SchedulingPoint::CaptureBackoff).await;
                return StepOutcome::CaptureRetry;
            }
        };

        let lease = self.held.insert(lease);
        let written = mjpeg::write_part(&mut self.transport, &self.boundary, lease.data()).await;

        if let Some(lease) = self.held.take() {
            debug!(
                "Session {}: frame #{} held for {:?}",
                self.id,
                lease.sequence(),
                lease.acquired_at().elapsed()
            );
            lease.release();
        }

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                self.terminate(TerminationReason::WriteFailed(e));
                return StepOutcome::Terminated;
            }
        };

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        self.check_memory();

        self.scheduler.suspend(SchedulingPoint::Pacing).await;
        self.stats.pacing_sleeps += 1;

        let frames = self.stats.frames_sent;
        if self.scheduler.is_fairness_frame(frames) {
            self.scheduler.suspend(SchedulingPoint::Fairness).await;
            self.stats.yields += 1;
            self.last_yield_frame = frames;
        }
        if self.scheduler.is_settle_frame(frames) {
            self.scheduler.suspend(SchedulingPoint::Settle).await;
            self.stats.settles += 1;
        }

        StepOutcome::FrameSent { bytes }
    }

    /// Sends the stream head and loops until the session terminates.
    pub async fn run(mut self) -> SessionReport {
        info!("Stream session {} started", self.id);

        let content_type = mjpeg::stream_content_type(&self.boundary);
        if let Err(e) = self.transport.begin_stream(&content_type).await {
            self.terminate(TerminationReason::WriteFailed(e));
        }

        while self.state == SessionState::Streaming {
            self.step().await;
        }

        self.into_report()
    }

    /// Consumes the session into its final report.
    pub fn into_report(mut self) -> SessionReport {
        if let Some(lease) = self.held.take() {
            lease.release();
        }

        let report = SessionReport {
            id: self.id,
            stats: std::mem::take(&mut self.stats),
            reason: self.reason.take().unwrap_or(TerminationReason::Stopped),
            duration: self.started.elapsed(),
        };

        info!(
            "Stream session {} ended ({}): {} frames, {} bytes, {:.1} fps",
            report.id,
            report.reason,
            report.stats.frames_sent,
            report.stats.bytes_sent,
            report.fps()
        );
        report
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().map_or(false, |rx| *rx.borrow())
    }

    fn terminate(&mut self, reason: TerminationReason) {
        if self.state == SessionState::Terminated {
            return;
        }
        debug!("Session {} terminating: {}", self.id, reason);
        self.state = SessionState::Terminated;
        self.reason = Some(reason);
    }

    fn check_memory(&mut self) {
        if !self.watchdog.is_due(self.last_memory_check) {
            return;
        }
        self.last_memory_check = Instant::now();
        self.stats.memory_checks += 1;

        if let Some(sample) = self.watchdog.sample() {
            if sample.level == MemoryLevel::Critical {
                // Advisory only, the stream carries on. The watchdog already logged it.
                self.stats.critical_signals += 1;
                debug!(
                    "Session {}: memory CRITICAL at frame {} ({} bytes free)",
                    self.id, self.stats.frames_sent, sample.free_bytes
                );
            }
        }
    }
}
