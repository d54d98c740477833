use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use rover_camera_streamer::capture::{FramePool, FrameSource, SyntheticSource};
use rover_camera_streamer::config::{Config, ConfigError, SourceKind};
use rover_camera_streamer::memory::{MemoryWatchdog, ProcMeminfo};
use rover_camera_streamer::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about = "MJPEG camera streamer for the rover", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

const DEFAULT_CONFIG: &str = "config.toml";

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match Config::load(&cli.config) {
        Ok(config) => {
            log::info!("Loaded configuration from {}", cli.config.display());
            config
        }
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound && cli.config == PathBuf::from(DEFAULT_CONFIG) => {
            log::info!("No {} found, using defaults", DEFAULT_CONFIG);
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to load config from {}", cli.config.display()));
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

fn open_source(config: &Config) -> Result<Arc<dyn FrameSource>> {
    let pool = FramePool::new(config.camera.buffer_count, config.camera.acquire_timeout());

    match config.camera.source {
        SourceKind::Synthetic => {
            log::warn!("Using synthetic frames, no camera attached");
            Ok(Arc::new(SyntheticSource::new(pool, config.camera.synthetic_frame_bytes)))
        }
        SourceKind::V4l2 => open_v4l2(pool, config),
    }
}

#[cfg(feature = "camera-v4l")]
fn open_v4l2(pool: FramePool, config: &Config) -> Result<Arc<dyn FrameSource>> {
    use rover_camera_streamer::capture::V4l2Source;

    let source = V4l2Source::open(pool, &config.camera)
        .with_context(|| format!("Failed to open camera {}", config.camera.device))?;
    Ok(Arc::new(source))
}

#[cfg(not(feature = "camera-v4l"))]
fn open_v4l2(_pool: FramePool, _config: &Config) -> Result<Arc<dyn FrameSource>> {
    anyhow::bail!("camera.source = \"v4l2\" requires building with --features camera-v4l")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    log::info!("Starting rover camera streamer v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    config.log_summary();

    let source = open_source(&config)?;
    let watchdog = Arc::new(MemoryWatchdog::new(
        Box::new(ProcMeminfo::default()),
        config.memory.thresholds()?,
        config.memory.check_interval(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = server::bind(&config.server).await?;
    let state = AppState::new(config, source, watchdog, shutdown_rx);

    let server_handle = tokio::spawn(server::run_server(listener, state.clone()));

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    log::info!("Shutdown requested");
    shutdown_tx.send_replace(true);

    server_handle.await??;

    let totals = state.totals();
    log::info!(
        "Served {} frames ({} bytes) across all streams",
        totals.frames_sent,
        totals.bytes_sent
    );
    Ok(())
}
