//! End-to-end over real sockets with a synthetic camera

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use rover_camera_streamer::capture::{FramePool, SyntheticSource};
use rover_camera_streamer::config::Config;
use rover_camera_streamer::memory::MemoryWatchdog;
use rover_camera_streamer::server::{run_server, AppState};
use rover_camera_streamer::testing::FixedProbe;

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(max_streams: usize) -> Self {
        let mut config = Config::default();
        config.server.max_streams = max_streams;
        config.server.recv_timeout_ms = 200;
        config.stream.frame_delay_ms = Some(20);
        config.stream.extra_yield_delay_ms = 5;
        config.stream.capture_backoff_ms = 5;

        let pool = FramePool::new(config.camera.buffer_count, config.camera.acquire_timeout());
        let source = Arc::new(SyntheticSource::new(pool, 256));
        let watchdog = Arc::new(MemoryWatchdog::new(
            Box::new(FixedProbe::new(150_000)),
            config.memory.thresholds().unwrap(),
            config.memory.check_interval(),
        ));

        let (shutdown, rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(run_server(listener, AppState::new(config, source, watchdog, rx)));

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn request(&self, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        stream
    }

    /// Full response of a bounded request
    async fn get(&self, path: &str) -> Vec<u8> {
        let mut stream = self.request(path).await;
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        self.handle.await.unwrap().unwrap();
    }
}

fn split_response(response: &[u8]) -> (String, &[u8]) {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no end of headers");
    (
        String::from_utf8_lossy(&response[..end]).into_owned(),
        &response[end + 4..],
    )
}

/// Reads from a stream until `needle` has been seen `count` times
async fn read_until_count(stream: &mut TcpStream, needle: &[u8], count: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.windows(needle.len()).filter(|w| *w == needle).count() < count {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    received
}

#[tokio::test]
async fn test_capture_returns_jpeg() {
    let server = TestServer::start(2).await;

    let response = server.get("/capture").await;
    let (head, body) = split_response(&response);

    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert!(head.contains("Content-Disposition: inline; filename=capture.jpg"));
    assert!(head.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    assert_eq!(&body[body.len() - 2..], &[0xFF, 0xD9]);

    server.stop().await;
}

#[tokio::test]
async fn test_stream_sends_multipart_frames() {
    let server = TestServer::start(2).await;

    let mut stream = server.request("/stream").await;
    let received = read_until_count(&mut stream, b"--frame\r\n", 3).await;
    let (head, body) = split_response(&received);

    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    assert!(head.contains("Cache-Control: no-cache"));
    assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 260\r\n\r\n\xFF\xD8"));

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_streams_beyond_limit_refused() {
    let server = TestServer::start(1).await;

    let mut first = server.request("/stream").await;
    read_until_count(&mut first, b"--frame\r\n", 1).await;

    let response = server.get("/stream").await;
    assert!(response.starts_with(b"HTTP/1.1 503 Service Unavailable"));

    drop(first);
    server.stop().await;
}

#[tokio::test]
async fn test_status_reports_json() {
    let server = TestServer::start(2).await;

    let response = server.get("/status").await;
    let (head, body) = split_response(&response);
    assert!(head.contains("Content-Type: application/json"));

    let status: serde_json::Value = serde_json::from_slice(body).unwrap();
    assert_eq!(status["stream_mode"], "stable");
    assert_eq!(status["frame_delay_ms"], 20);
    assert_eq!(status["max_streams"], 2);
    assert_eq!(status["pool"]["capacity"], 2);
    assert_eq!(status["pool"]["outstanding"], 0);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let server = TestServer::start(2).await;

    let response = server.get("/nope").await;
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found"));

    server.stop().await;
}

#[tokio::test]
async fn test_capture_failure_has_no_attachment_header() {
    let mut config = Config::default();
    config.snapshot.max_frame_bytes = 16;

    let pool = FramePool::new(1, Duration::ZERO);
    let source = Arc::new(SyntheticSource::new(pool, 256));
    let watchdog = Arc::new(MemoryWatchdog::new(
        Box::new(FixedProbe::new(150_000)),
        config.memory.thresholds().unwrap(),
        config.memory.check_interval(),
    ));
    let (shutdown, rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(run_server(listener, AppState::new(config, source, watchdog, rx)));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /capture HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let (head, _) = split_response(&response);

    assert!(head.starts_with("HTTP/1.1 500 Internal Server Error"));
    assert!(head.contains("Access-Control-Allow-Origin: *"));
    assert!(!head.contains("Content-Disposition"));

    shutdown.send_replace(true);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_silent_client_dropped() {
    let server = TestServer::start(2).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"GET /sta").await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.is_empty());

    let status = server.get("/status").await;
    assert!(status.starts_with(b"HTTP/1.1 200 OK"));

    server.stop().await;
}

#[tokio::test]
async fn test_post_not_allowed() {
    let server = TestServer::start(2).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"POST /capture HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 405 Method Not Allowed"));

    server.stop().await;
}
