use assert_matches::assert_matches;
use bytes::Bytes;
use std::sync::Arc;

use rover_camera_streamer::capture::{CaptureError, FrameSource};
use rover_camera_streamer::config::SnapshotConfig;
use rover_camera_streamer::snapshot::{SnapshotError, SnapshotHandler};
use rover_camera_streamer::testing::{RecordingTransport, ScriptedSource};
use rover_camera_streamer::transport::TransportError;

const MAX_FRAME: usize = 64;

fn handler(source: Arc<ScriptedSource>) -> SnapshotHandler {
    SnapshotHandler::new(
        source,
        &SnapshotConfig {
            min_interval_ms: 1000,
            stabilize_delay_ms: 100,
            max_frame_bytes: MAX_FRAME,
        },
    )
}

fn assert_all_released(source: &ScriptedSource) {
    let pool = source.pool_stats();
    assert_eq!(pool.outstanding, 0);
    assert_eq!(pool.acquired, pool.released);
}

#[tokio::test(start_paused = true)]
async fn test_empty_frame_rejected_and_released() {
    let source = Arc::new(ScriptedSource::new(1));
    source.push_frame(Bytes::new());
    let handler = handler(source.clone());
    let mut transport = RecordingTransport::new();

    assert_matches!(
        handler.handle(&mut transport).await,
        Err(SnapshotError::InvalidFrame { len: 0, max: MAX_FRAME })
    );
    assert_all_released(&source);
    assert_eq!(source.pool_stats().acquired, 1);
    assert!(transport.log().responses.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_frame_rejected_and_released() {
    let source = Arc::new(ScriptedSource::new(1));
    source.push_frame(vec![0xAB; MAX_FRAME + 1]);
    let handler = handler(source.clone());
    let mut transport = RecordingTransport::new();

    assert_matches!(
        handler.handle(&mut transport).await,
        Err(SnapshotError::InvalidFrame { len, .. }) if len == MAX_FRAME + 1
    );
    assert_all_released(&source);
    assert!(transport.log().responses.is_empty());
    assert_eq!(handler.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_frame_at_size_limit_served() {
    let source = Arc::new(ScriptedSource::new(1));
    source.push_frame(vec![0xAB; MAX_FRAME]);
    let handler = handler(source.clone());
    let mut transport = RecordingTransport::new();

    assert_eq!(handler.handle(&mut transport).await.unwrap(), MAX_FRAME);
    assert_all_released(&source);
    assert_eq!(transport.log().responses[0].0.len(), MAX_FRAME);
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_surfaced_and_released() {
    let source = Arc::new(ScriptedSource::new(1));
    let handler = handler(source.clone());
    let mut transport = RecordingTransport::new();
    transport.fail_after(0);

    assert_matches!(
        handler.handle(&mut transport).await,
        Err(SnapshotError::Write(TransportError::Io(_)))
    );
    assert_all_released(&source);
    assert_eq!(handler.stats().failed, 1);
    assert_eq!(handler.stats().served, 0);
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_surfaced() {
    let source = Arc::new(ScriptedSource::new(1));
    source.push_failures(1);
    let handler = handler(source.clone());

    assert_matches!(
        handler.handle(&mut RecordingTransport::new()).await,
        Err(SnapshotError::Capture(CaptureError::Device(_)))
    );
    assert_all_released(&source);
}

#[tokio::test(start_paused = true)]
async fn test_single_buffer_survives_repeated_snapshots() {
    let source = Arc::new(ScriptedSource::new(1));
    let handler = handler(source.clone());
    let mut transport = RecordingTransport::new();

    for _ in 0..5 {
        handler.handle(&mut transport).await.unwrap();
    }

    assert_all_released(&source);
    assert_eq!(handler.stats().served, 5);
    assert_eq!(handler.stats().stabilized, 4);
    assert_eq!(transport.log().responses.len(), 5);
}
