// src/main.rs

use std::process::ExitCode;

use anyhow::Context;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use cam_stream_recorder::config::{self, CameraDescriptor};
use cam_stream_recorder::orchestrator::{self, Orchestrator};
use cam_stream_recorder::rtsp::RtspSession;
use cam_stream_recorder::storage::StorageDispatcher;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("[recorder] startup failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether at least one camera ended without failing.
fn run() -> anyhow::Result<bool> {
    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".into());

    let cfg = config::load(&cfg_path)?;
    info!(
        "[recorder] loaded {} ({} camera(s), {} MB segments)",
        cfg_path,
        cfg.recorders.len(),
        cfg.max_size_in_megabytes
    );

    let orchestrator = Orchestrator::from_config(&cfg)?;

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let cancel = CancellationToken::new();
    {
        let c = cancel.clone();
        ctrlc::set_handler(move || {
            info!("[recorder] shutdown requested");
            c.cancel();
        })
        .context("installing signal handler")?;
    }

    // ------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------
    let (tx, rx) = crossbeam_channel::unbounded();
    let storage = StorageDispatcher::new(orchestrator.cameras()).spawn(rx)?;
    let orchestrator = orchestrator.with_notifier(tx);

    // ------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    let reports = runtime.block_on(orchestrator.run(
        |camera: &CameraDescriptor| RtspSession::new(camera.name.clone(), &camera.url, camera.transport),
        cancel,
    ));
    drop(runtime);

    // ------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------
    // the last notifier went away with the workers
    if storage.join().is_err() {
        error!("[storage] dispatcher thread panicked");
    }

    for report in &reports {
        info!(
            "[recorder] {}: {} after {} attempt(s), {} segment(s), {} unit(s), {} dropped",
            report.camera,
            report.state,
            report.attempts,
            report.mux.segments_completed,
            report.mux.units_written,
            report.mux.units_dropped
        );
    }

    let ok = !orchestrator::all_failed(&reports);
    info!("[recorder] shutdown complete");
    Ok(ok)
}
