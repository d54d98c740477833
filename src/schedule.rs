//! Scheduling points of the stream loop
//!
//! The runtime is cooperative: a stream session keeps the worker until it
//! suspends on its own. Every place the loop gives up the worker is one of
//! the points below, each with its own knob so frame pacing and control
//! responsiveness can be tuned independently.

use log::trace;
use std::time::Duration;

use crate::config::StreamConfig;

/// Why the loop is suspending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulingPoint {
    /// Inter-frame delay, sets the frame rate
    Pacing,

    /// Explicit yield so control handlers get a guaranteed window
    Fairness,

    /// Idle pause with no I/O so transient allocations can be reclaimed
    Settle,

    /// Short wait after a failed capture
    CaptureBackoff,
}

/// Durations and periods for every scheduling point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub frame_delay: Duration,

    /// Yield every N frames, 0 disables
    pub yield_every: u64,
    pub yield_delay: Duration,

    /// Settle every M frames, 0 disables
    pub settle_every: u64,
    pub settle_delay: Duration,

    pub capture_backoff: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        StreamConfig::default().schedule_policy()
    }
}

/// Carries out suspensions according to a [`SchedulePolicy`]
#[derive(Debug, Clone)]
pub struct Scheduler {
    policy: SchedulePolicy,
}

impl Scheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// True when the frame with this 1-based count ends on a fairness yield
    pub fn is_fairness_frame(&self, frames_sent: u64) -> bool {
        is_multiple(frames_sent, self.policy.yield_every)
    }

    /// True when the frame with this 1-based count ends on a settle pause
    pub fn is_settle_frame(&self, frames_sent: u64) -> bool {
        is_multiple(frames_sent, self.policy.settle_every)
    }

    /// Suspends the current task at the given point.
    pub async fn suspend(&self, point: SchedulingPoint) {
        trace!("Scheduling point {:?}", point);
        match point {
            SchedulingPoint::Pacing => pause(self.policy.frame_delay).await,
            SchedulingPoint::Fairness => {
                tokio::task::yield_now().await;
                if !self.policy.yield_delay.is_zero() {
                    tokio::time::sleep(self.policy.yield_delay).await;
                }
            }
            SchedulingPoint::Settle => pause(self.policy.settle_delay).await,
            SchedulingPoint::CaptureBackoff => pause(self.policy.capture_backoff).await,
        }
    }
}

fn is_multiple(count: u64, every: u64) -> bool {
    every > 0 && count > 0 && count % every == 0
}

/// Sleeps, or at least yields when the delay is zero so the point still suspends.
async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}
