//! Free-memory watchdog
//!
//! The device has no swap, so running out of heap is fatal. The watchdog
//! samples free memory when a stream session asks it to, classifies the
//! sample against two fixed thresholds and keeps the latest sample around
//! for diagnostics. Classification is advisory: nothing here stops frames.

use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ConfigError;

/// Health level derived from a free-byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryLevel::Normal => "NORMAL",
            MemoryLevel::Warning => "WARNING",
            MemoryLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Warning and critical free-memory boundaries, in bytes.
///
/// Always satisfies `critical < warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryThresholds {
    warning: u64,
    critical: u64,
}

impl MemoryThresholds {
    pub fn new(warning: u64, critical: u64) -> Result<Self, ConfigError> {
        if critical >= warning {
            return Err(ConfigError::Invalid(format!(
                "memory critical threshold ({}) must be below the warning threshold ({})",
                critical, warning
            )));
        }
        Ok(Self { warning, critical })
    }

    pub fn warning(&self) -> u64 {
        self.warning
    }

    pub fn critical(&self) -> u64 {
        self.critical
    }

    pub fn level(&self, free_bytes: u64) -> MemoryLevel {
        if free_bytes < self.critical {
            MemoryLevel::Critical
        } else if free_bytes < self.warning {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }
}

/// One free-memory reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub free_bytes: u64,
    pub level: MemoryLevel,

    /// Milliseconds since the watchdog was created
    pub uptime_ms: u64,

    #[serde(skip)]
    pub taken_at: Instant,
}

/// Reads the amount of memory still available to the process
pub trait MemoryProbe: Send + Sync {
    fn free_bytes(&self) -> io::Result<u64>;
}

/// Linux probe reading `/proc/meminfo`
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcMeminfo {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryProbe for ProcMeminfo {
    fn free_bytes(&self) -> io::Result<u64> {
        let content = std::fs::read_to_string(&self.path)?;
        parse_meminfo(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no MemAvailable/MemFree entry in {}", self.path.display()),
            )
        })
    }
}

/// Extracts available memory in bytes, preferring `MemAvailable` over `MemFree`.
fn parse_meminfo(content: &str) -> Option<u64> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kib * 1024)
        })
    };

    field("MemAvailable").or_else(|| field("MemFree"))
}

/// Periodic free-memory classifier.
///
/// There is no background task: stream sessions call [`MemoryWatchdog::sample`]
/// from their own loop whenever [`MemoryWatchdog::is_due`] says so.
pub struct MemoryWatchdog {
    probe: Box<dyn MemoryProbe>,
    thresholds: MemoryThresholds,
    period: Duration,
    started: Instant,
    last: Mutex<Option<MemorySample>>,
    samples_taken: AtomicU64,
    critical_signals: AtomicU64,
}

impl MemoryWatchdog {
    pub fn new(probe: Box<dyn MemoryProbe>, thresholds: MemoryThresholds, period: Duration) -> Self {
        Self {
            probe,
            thresholds,
            period,
            started: Instant::now(),
            last: Mutex::new(None),
            samples_taken: AtomicU64::new(0),
            critical_signals: AtomicU64::new(0),
        }
    }

    /// Whether a sample is due given the time of the caller's previous check
    pub fn is_due(&self, last_check: Instant) -> bool {
        last_check.elapsed() >= self.period
    }

    pub fn classify(&self, free_bytes: u64) -> MemoryLevel {
        self.thresholds.level(free_bytes)
    }

    /// Takes and records a sample. Returns `None` if the probe could not be read.
    pub fn sample(&self) -> Option<MemorySample> {
        let free_bytes = match self.probe.free_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Memory probe failed: {}", e);
                return None;
            }
        };

        let now = Instant::now();
        let sample = MemorySample {
            free_bytes,
            level: self.classify(free_bytes),
            uptime_ms: now.duration_since(self.started).as_millis() as u64,
            taken_at: now,
        };

        let previous = self.last.lock().replace(sample).map(|s| s.level);
        self.samples_taken.fetch_add(1, Ordering::Relaxed);

        match sample.level {
            MemoryLevel::Critical => {
                self.critical_signals.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Free memory CRITICAL: {} bytes (critical below {})",
                    free_bytes, self.thresholds.critical
                );
            }
            MemoryLevel::Warning => {
                warn!(
                    "Free memory low: {} bytes (warning below {})",
                    free_bytes, self.thresholds.warning
                );
            }
            MemoryLevel::Normal if previous.map_or(false, |p| p > MemoryLevel::Normal) => {
                info!("Free memory back to normal: {} bytes", free_bytes);
            }
            MemoryLevel::Normal => {}
        }

        Some(sample)
    }

    pub fn last_sample(&self) -> Option<MemorySample> {
        *self.last.lock()
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken.load(Ordering::Relaxed)
    }

    /// Number of CRITICAL samples observed so far
    pub fn critical_signals(&self) -> u64 {
        self.critical_signals.load(Ordering::Relaxed)
    }
}
