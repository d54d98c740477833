//! Minimal HTTP/1.1 front end: stream, snapshot and status endpoints

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::capture::{FrameSource, PoolStats};
use crate::config::{Config, ServerConfig, StreamMode};
use crate::memory::{MemorySample, MemoryWatchdog};
use crate::schedule::Scheduler;
use crate::snapshot::{SnapshotError, SnapshotHandler, SnapshotStats};
use crate::stream::{SessionStats, StreamSession};
use crate::transport::{HttpTransport, Transport};

const MAX_REQUEST_BYTES: usize = 1024;

/// Shared by every connection task
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    source: Arc<dyn FrameSource>,
    watchdog: Arc<MemoryWatchdog>,
    snapshots: Arc<SnapshotHandler>,
    session_counter: Arc<AtomicU64>,
    active_streams: Arc<AtomicUsize>,
    totals: Arc<Mutex<SessionStats>>,
    shutdown: watch::Receiver<bool>,
    started: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        source: Arc<dyn FrameSource>,
        watchdog: Arc<MemoryWatchdog>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let snapshots = Arc::new(SnapshotHandler::new(source.clone(), &config.snapshot));
        Self {
            config: Arc::new(config),
            source,
            watchdog,
            snapshots,
            session_counter: Arc::new(AtomicU64::new(0)),
            active_streams: Arc::new(AtomicUsize::new(0)),
            totals: Arc::new(Mutex::new(SessionStats::default())),
            shutdown,
            started: Instant::now(),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }

    /// Counters of all finished stream sessions
    pub fn totals(&self) -> SessionStats {
        self.totals.lock().clone()
    }

    pub fn status(&self) -> StatusResponse {
        let stream = &self.config.stream;
        StatusResponse {
            version: env!("CARGO_PKG_VERSION"),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            stream_mode: stream.mode,
            frame_delay_ms: stream.frame_delay().as_millis() as u64,
            active_streams: self.active_streams(),
            max_streams: self.config.server.max_streams,
            sessions_started: self.session_counter.load(Ordering::Relaxed),
            totals: self.totals(),
            snapshots: self.snapshots.stats(),
            pool: self.source.pool_stats(),
            memory: self.watchdog.last_sample(),
        }
    }

    fn reserve_stream(&self) -> Option<StreamSlot> {
        let max = self.config.server.max_streams;
        self.active_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| StreamSlot {
                active: self.active_streams.clone(),
            })
    }
}

/// Holds one of the `max_streams` places until dropped
struct StreamSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Body of `GET /status`
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_ms: u64,
    pub stream_mode: StreamMode,
    pub frame_delay_ms: u64,
    pub active_streams: usize,
    pub max_streams: usize,
    pub sessions_started: u64,
    pub totals: SessionStats,
    pub snapshots: SnapshotStats,
    pub pool: PoolStats,
    pub memory: Option<MemorySample>,
}

pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.bind_ip, config.port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

/// Accepts connections until shutdown is signalled.
///
/// Running streams see the same signal and end on their own.
pub async fn run_server(listener: TcpListener, state: AppState) -> Result<()> {
    let local = listener.local_addr()?;
    info!("Camera server listening on http://{}", local);
    info!("  stream:   http://{}/stream", local);
    info!("  snapshot: http://{}/capture", local);

    let mut shutdown = state.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, state).await {
                            error!("Connection from {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Camera server stopped accepting connections");
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, state: AppState) -> Result<()> {
    let recv_timeout = state.config.server.recv_timeout();
    let send_timeout = state.config.server.send_timeout();

    let head = match tokio::time::timeout(recv_timeout, read_request_head(&mut stream, MAX_REQUEST_BYTES)).await {
        Ok(head) => head?,
        Err(_) => {
            debug!("No request line from {} within {:?}, dropping", peer, recv_timeout);
            return Ok(());
        }
    };
    let request = String::from_utf8_lossy(&head);

    let mut transport = HttpTransport::new(stream).with_send_timeout(send_timeout);
    let (method, path) = match parse_request_line(&request) {
        Some(parts) => parts,
        None => {
            debug!("Unparseable request from {}", peer);
            transport.send_status(400, "Bad Request").await?;
            return Ok(());
        }
    };
    debug!("{} {} from {}", method, path, peer);

    if method != "GET" {
        transport.send_status(405, "Method Not Allowed").await?;
        return Ok(());
    }

    match path {
        "/stream" => serve_stream(transport, peer, &state).await,
        "/capture" => serve_capture(transport, &state).await,
        "/status" => {
            let body = serde_json::to_vec(&state.status())?;
            transport.send_response(&body, "application/json").await?;
            Ok(())
        }
        _ => {
            transport.send_status(404, "Not Found").await?;
            Ok(())
        }
    }
}

async fn serve_stream(mut transport: HttpTransport<TcpStream>, peer: SocketAddr, state: &AppState) -> Result<()> {
    let _slot = match state.reserve_stream() {
        Some(slot) => slot,
        None => {
            warn!(
                "Refusing stream for {}: {} of {} streams active",
                peer,
                state.active_streams(),
                state.config.server.max_streams
            );
            transport.send_status(503, "Service Unavailable").await?;
            return Ok(());
        }
    };

    let id = state.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Stream session {} for {}", id, peer);

    let stream_config = &state.config.stream;
    let session = StreamSession::new(
        id,
        transport,
        state.source.clone(),
        state.watchdog.clone(),
        Scheduler::new(stream_config.schedule_policy()),
        stream_config.boundary.clone(),
    )
    .with_shutdown(state.shutdown.clone());

    let report = session.run().await;
    state.totals.lock().merge(&report.stats);
    Ok(())
}

async fn serve_capture(mut transport: HttpTransport<TcpStream>, state: &AppState) -> Result<()> {
    transport.set_header("Content-Disposition", "inline; filename=capture.jpg");

    match state.snapshots.handle(&mut transport).await {
        Ok(_) => Ok(()),
        // Nothing more can be said to this client
        Err(SnapshotError::Write(e)) => {
            debug!("Snapshot response lost: {}", e);
            Ok(())
        }
        Err(_) => {
            transport.send_status(500, "Internal Server Error").await?;
            Ok(())
        }
    }
}

/// Reads until the request line is complete, the peer stops sending or
/// `limit` bytes have arrived
async fn read_request_head<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(limit);
    let mut buffer = vec![0; limit];
    while head.len() < limit {
        let n = reader.read(&mut buffer[..limit - head.len()]).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buffer[..n]);
        if head.windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }
    Ok(head)
}

/// Method and path (query string stripped) of the request line
fn parse_request_line(request: &str) -> Option<(&str, &str)> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    parts.next().filter(|version| version.starts_with("HTTP/"))?;

    let path = target.split('?').next().unwrap_or(target);
    Some((method, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryThresholds;
    use crate::testing::{FixedProbe, ScriptedSource};
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("GET /stream HTTP/1.1\r\nHost: x\r\n\r\n", Some(("GET", "/stream")))]
    #[case("GET /capture?_cb=123 HTTP/1.1\r\n\r\n", Some(("GET", "/capture")))]
    #[case("POST /status HTTP/1.0\r\n\r\n", Some(("POST", "/status")))]
    #[case("GET /stream\r\n", None)]
    #[case("", None)]
    #[case("garbage", None)]
    fn test_parse_request_line(#[case] request: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(parse_request_line(request), expected);
    }

    #[tokio::test]
    async fn test_request_line_split_across_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"GET /str")
            .read(b"eam HTTP/1.1\r\nHost: x\r\n\r\n")
            .build();

        let head = read_request_head(&mut reader, MAX_REQUEST_BYTES).await.unwrap();
        let request = String::from_utf8_lossy(&head);
        assert_eq!(parse_request_line(&request), Some(("GET", "/stream")));
    }

    #[tokio::test]
    async fn test_request_head_capped() {
        let mut reader = tokio_test::io::Builder::new().read(&[b'a'; 600]).read(&[b'a'; 424]).build();

        let head = read_request_head(&mut reader, MAX_REQUEST_BYTES).await.unwrap();
        assert_eq!(head.len(), MAX_REQUEST_BYTES);
    }

    #[tokio::test]
    async fn test_request_head_stops_at_eof() {
        let mut reader = tokio_test::io::Builder::new().read(b"GET / HTTP/1.1").build();

        let head = read_request_head(&mut reader, MAX_REQUEST_BYTES).await.unwrap();
        assert_eq!(head, b"GET / HTTP/1.1");
    }

    fn state(max_streams: usize) -> AppState {
        let mut config = Config::default();
        config.server.max_streams = max_streams;
        let watchdog = MemoryWatchdog::new(
            Box::new(FixedProbe::new(150_000)),
            MemoryThresholds::new(100_000, 80_000).unwrap(),
            Duration::from_secs(5),
        );
        let (_tx, rx) = watch::channel(false);
        AppState::new(config, Arc::new(ScriptedSource::new(2)), Arc::new(watchdog), rx)
    }

    #[test]
    fn test_stream_slots_are_bounded_and_returned() {
        let state = state(2);

        let first = state.reserve_stream();
        let second = state.reserve_stream();
        assert!(first.is_some() && second.is_some());
        assert!(state.reserve_stream().is_none());
        assert_eq!(state.active_streams(), 2);

        drop(first);
        assert_eq!(state.active_streams(), 1);
        assert!(state.reserve_stream().is_some());
    }

    #[tokio::test]
    async fn test_status_reports_config_and_pool() {
        let state = state(1);
        let status = state.status();

        assert_eq!(status.stream_mode, StreamMode::Stable);
        assert_eq!(status.frame_delay_ms, 200);
        assert_eq!(status.max_streams, 1);
        assert_eq!(status.pool.capacity, 2);
        assert!(status.memory.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stream_mode"], "stable");
        assert_eq!(json["active_streams"], 0);
        assert!(json["memory"].is_null());
    }
}
