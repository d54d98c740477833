//! Log output of a stream session under memory pressure

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use rover_camera_streamer::memory::{MemoryThresholds, MemoryWatchdog};
use rover_camera_streamer::schedule::{SchedulePolicy, Scheduler};
use rover_camera_streamer::stream::StreamSession;
use rover_camera_streamer::testing::{FixedProbe, RecordingTransport, ScriptedSource};

/// Keeps every record at warn or above
struct CapturingLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl Log for CapturingLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if record.level() <= Level::Warn {
            self.records.lock().push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger {
    records: parking_lot::const_mutex(Vec::new()),
};

#[tokio::test(start_paused = true)]
async fn test_critical_memory_logged_once_per_sample() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    let watchdog = Arc::new(MemoryWatchdog::new(
        Box::new(FixedProbe::new(50_000)),
        MemoryThresholds::new(100_000, 80_000).unwrap(),
        Duration::from_secs(1),
    ));
    let transport = RecordingTransport::new();
    transport.fail_after(12 * 3);

    let report = StreamSession::new(
        1,
        transport,
        Arc::new(ScriptedSource::new(1)),
        watchdog,
        Scheduler::new(SchedulePolicy::default()),
        "frame",
    )
    .run()
    .await;
    assert!(report.stats.critical_signals >= 1);

    let records = LOGGER.records.lock();
    let critical = records.iter().filter(|(_, msg)| msg.contains("CRITICAL")).count();
    assert_eq!(critical as u64, report.stats.critical_signals);
    assert!(records
        .iter()
        .filter(|(_, msg)| msg.contains("CRITICAL"))
        .all(|(level, _)| *level == Level::Error));
}
