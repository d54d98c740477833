//! Camera streaming core for a remotely operated rover
//!
//! This library turns a camera peripheral into a continuous MJPEG HTTP stream
//! while leaving scheduling headroom for the control handlers that share the
//! device:
//! - Frame buffers are leased from a bounded pool and released exactly once
//! - Stream sessions suspend at declared scheduling points (pacing, fairness, settling)
//! - Free memory is sampled on the session's own timer and classified into levels
//! - One-shot snapshots are debounced and validated before they are served
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rover_camera_streamer::capture::{FramePool, SyntheticSource};
//! use rover_camera_streamer::config::Config;
//! use rover_camera_streamer::memory::{MemoryWatchdog, ProcMeminfo};
//!
//! # fn main() -> Result<(), rover_camera_streamer::ConfigError> {
//! let config = Config::default();
//! let pool = FramePool::new(config.camera.buffer_count, config.camera.acquire_timeout());
//! let source = Arc::new(SyntheticSource::new(pool, 4096));
//! let watchdog = MemoryWatchdog::new(
//!     Box::new(ProcMeminfo::default()),
//!     config.memory.thresholds()?,
//!     config.memory.check_interval(),
//! );
//! // ... hand `source` and `watchdog` to a StreamSession
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod memory;
pub mod schedule;
pub mod server;
pub mod snapshot;
pub mod stream;
pub mod testing;
pub mod transport;

// Re-exports for convenience
pub use capture::{CaptureError, FrameLease, FramePool, FrameSource, PoolStats};
pub use config::{Config, ConfigError};
pub use memory::{MemoryLevel, MemorySample, MemoryThresholds, MemoryWatchdog};
pub use schedule::{SchedulePolicy, Scheduler, SchedulingPoint};
pub use snapshot::{SnapshotError, SnapshotHandler};
pub use stream::{SessionReport, SessionState, SessionStats, StreamSession, TerminationReason};
pub use transport::{Transport, TransportError};
