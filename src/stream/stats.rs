//! Stream session statistics

use serde::{Deserialize, Serialize};

/// Counters kept by one stream session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames fully written to the client
    pub frames_sent: u64,

    /// Bytes written, framing included
    pub bytes_sent: u64,

    /// Captures that failed and were retried
    pub capture_failures: u64,

    /// Inter-frame pacing sleeps
    pub pacing_sleeps: u64,

    /// Explicit fairness yields
    pub yields: u64,

    /// Idle settle pauses
    pub settles: u64,

    /// Memory samples taken
    pub memory_checks: u64,

    /// Samples that came back CRITICAL
    pub critical_signals: u64,

    /// Leases found still held at the top of the loop
    pub stale_leases_released: u64,
}

impl SessionStats {
    /// Adds another session's counters to these
    pub fn merge(&mut self, other: &SessionStats) {
        self.frames_sent += other.frames_sent;
        self.bytes_sent += other.bytes_sent;
        self.capture_failures += other.capture_failures;
        self.pacing_sleeps += other.pacing_sleeps;
        self.yields += other.yields;
        self.settles += other.settles;
        self.memory_checks += other.memory_checks;
        self.critical_signals += other.critical_signals;
        self.stale_leases_released += other.stale_leases_released;
    }

    /// Frame rate over `elapsed_secs`
    pub fn calculate_fps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.frames_sent as f64 / elapsed_secs
    }
}
