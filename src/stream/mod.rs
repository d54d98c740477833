//! Continuous MJPEG streaming to one connection per session

pub mod mjpeg;
mod session;
mod stats;

pub use session::{SessionReport, SessionState, StepOutcome, StreamSession, TerminationReason};
pub use stats::SessionStats;
