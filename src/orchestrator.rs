// src/orchestrator.rs

use std::time::Duration;

use crossbeam_channel::Sender;
use futures_util::future::join_all;
use log::{info, warn};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::{CameraDescriptor, Config, ReconnectConfig};
use crate::core::error::ConfigError;
use crate::recorder::{CompletedFile, MuxStats, MuxerConfig};
use crate::rtp::ExtractStats;
use crate::rtsp::StreamSource;
use crate::worker::{RecordingWorker, WorkerReport, WorkerState, DEFAULT_STOP_GRACE};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub muxer: MuxerConfig,
    pub reconnect: ReconnectConfig,
    /// Per worker, counted from cancellation.
    pub shutdown_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            muxer: MuxerConfig::default(),
            reconnect: ReconnectConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Runs one worker per camera and collects their reports.
pub struct Orchestrator {
    cameras: Vec<CameraDescriptor>,
    settings: OrchestratorSettings,
    notifier: Option<Sender<CompletedFile>>,
}

impl Orchestrator {
    pub fn new(cameras: Vec<CameraDescriptor>, settings: OrchestratorSettings) -> Self {
        Self {
            cameras,
            settings,
            notifier: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let settings = OrchestratorSettings {
            muxer: MuxerConfig {
                max_segment_bytes: cfg.max_segment_bytes(),
                ..MuxerConfig::default()
            },
            reconnect: cfg.reconnect.clone(),
            shutdown_timeout: cfg.shutdown_timeout(),
            stop_grace: DEFAULT_STOP_GRACE.min(cfg.shutdown_timeout()),
        };
        Ok(Self::new(cfg.camera_descriptors()?, settings))
    }

    pub fn with_notifier(mut self, notifier: Sender<CompletedFile>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn cameras(&self) -> &[CameraDescriptor] {
        &self.cameras
    }

    /// Starts every worker and returns once all of them ended, in camera
    /// order. Cancelling `cancel` stops all workers; a worker still running
    /// `shutdown_timeout` after that is aborted.
    pub async fn run<S, F>(self, make_source: F, cancel: CancellationToken) -> Vec<WorkerReport>
    where
        S: StreamSource + 'static,
        F: Fn(&CameraDescriptor) -> S + Clone + Send + 'static,
    {
        let Orchestrator {
            cameras,
            settings,
            notifier,
        } = self;

        info!("[orchestrator] starting {} worker(s)", cameras.len());

        let supervised = cameras.into_iter().map(|camera| {
            let name = camera.name.clone();
            let token = cancel.child_token();

            let mut worker = RecordingWorker::new(camera, settings.muxer)
                .with_reconnect(settings.reconnect.clone())
                .with_stop_grace(settings.stop_grace);
            if let Some(tx) = &notifier {
                worker = worker.with_notifier(tx.clone());
            }

            let handle = tokio::spawn(worker.run(make_source.clone(), token.clone()));
            supervise(name, handle, token, settings.shutdown_timeout)
        });

        let reports = join_all(supervised).await;

        let failed = reports
            .iter()
            .filter(|r| matches!(r.state, WorkerState::Failed(_)))
            .count();
        info!(
            "[orchestrator] all workers ended ({} stopped, {} failed)",
            reports.len() - failed,
            failed
        );
        reports
    }
}

/// True when there was nothing to run or nothing ended cleanly.
pub fn all_failed(reports: &[WorkerReport]) -> bool {
    reports
        .iter()
        .all(|r| matches!(r.state, WorkerState::Failed(_)))
}

async fn supervise(
    camera: String,
    mut handle: JoinHandle<WorkerReport>,
    cancel: CancellationToken,
    deadline: Duration,
) -> WorkerReport {
    tokio::select! {
        joined = &mut handle => return joined_report(camera, joined),
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(joined) => joined_report(camera, joined),
        Err(_) => {
            warn!(
                "[orchestrator] {} did not shut down within {:?}, aborting",
                camera, deadline
            );
            handle.abort();
            failed_report(camera, "shutdown timed out")
        }
    }
}

fn joined_report(camera: String, joined: Result<WorkerReport, JoinError>) -> WorkerReport {
    match joined {
        Ok(report) => report,
        Err(e) => {
            warn!("[orchestrator] worker {} ended abnormally: {}", camera, e);
            let reason = if e.is_panic() { "worker panicked" } else { "worker cancelled" };
            failed_report(camera, reason)
        }
    }
}

fn failed_report(camera: String, reason: &str) -> WorkerReport {
    WorkerReport {
        camera,
        state: WorkerState::Failed(reason.to_string()),
        attempts: 0,
        mux: MuxStats::default(),
        extract: ExtractStats::default(),
    }
}
