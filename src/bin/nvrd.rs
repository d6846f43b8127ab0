//! nvrd - network video recorder daemon
//!
//! This daemon:
//! 1. Loads the configuration (file named by --config / NVR_CONFIG, then env)
//! 2. Starts every configured stream (reader, HLS, detection, recording)
//! 3. Logs a health line per stream every few seconds
//! 4. Shuts down through the priority-ordered coordinator on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use nvr_core::{NvrConfig, Runtime};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "NVR_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides storage_path (HLS output, pre-buffer spill, default MP4 root).
    #[arg(long)]
    storage_path: Option<PathBuf>,
    /// Overrides models_path.
    #[arg(long)]
    models_path: Option<PathBuf>,
    /// Seconds between health lines.
    #[arg(long, default_value_t = 10)]
    health_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = NvrConfig::load_from(args.config.as_deref())?;
    if let Some(path) = args.storage_path {
        config.storage_path = path;
    }
    if let Some(path) = args.models_path {
        config.models_path = path;
    }
    if config.streams.is_empty() {
        log::warn!("nvrd: no streams configured");
    }

    let runtime = Runtime::new(config)?;
    let started = runtime.start_all();
    log::info!(
        "nvrd {} running: {}/{} streams started",
        env!("CARGO_PKG_VERSION"),
        started,
        runtime.streams().count()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let interval = Duration::from_secs(args.health_interval.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                for health in runtime.health() {
                    log::info!(
                        "stream {}: {} fps={:.1} frames={} dropped={} errors={}{}{}",
                        health.name,
                        health.status,
                        health.fps,
                        health.frames_received,
                        health.frames_dropped,
                        health.errors,
                        if health.recording { " recording" } else { "" },
                        health
                            .last_error
                            .as_deref()
                            .map(|e| format!(" last_error={}", e))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    log::info!("nvrd: shutdown signal received");
    let report = runtime.shutdown();
    if !report.forced.is_empty() {
        log::warn!("nvrd: forced stop of {}", report.forced.join(", "));
    }
    Ok(())
}
