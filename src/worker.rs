// src/worker.rs

use std::fmt;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{CameraDescriptor, ReconnectConfig};
use crate::core::error::{MuxError, WorkerError};
use crate::core::logging::{ComponentLogger, LogContext};
use crate::recorder::{CompletedFile, MuxStats, MuxerConfig, SegmentMuxer};
use crate::rtp::{AccessUnitExtractor, ExtractStats, RtpPacket};
use crate::rtsp::{PacketSink, StreamSource};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const DROP_WARN_EVERY: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Recording,
    Stopping,
    Stopped,
    Failed(String),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed(_))
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Initializing => write!(f, "initializing"),
            WorkerState::Recording => write!(f, "recording"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Final account of one camera's recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub camera: String,
    pub state: WorkerState,
    pub attempts: u32,
    pub mux: MuxStats,
    pub extract: ExtractStats,
}

/// Extractor plus muxer behind the [`PacketSink`] seam.
///
/// Recoverable drops are counted and logged; only fatal muxer errors
/// reach the session.
pub struct PacketPipeline {
    extractor: AccessUnitExtractor,
    muxer: SegmentMuxer,
    dropped: u64,
}

impl PacketPipeline {
    pub fn new(muxer: SegmentMuxer) -> Self {
        Self {
            extractor: AccessUnitExtractor::new(),
            muxer,
            dropped: 0,
        }
    }

    pub fn into_parts(self) -> (SegmentMuxer, ExtractStats) {
        let stats = self.extractor.stats();
        (self.muxer, stats)
    }

    fn note_drop(&mut self, err: &MuxError) {
        self.dropped += 1;
        if self.dropped == 1 || self.dropped % DROP_WARN_EVERY == 0 {
            self.muxer
                .warn(&format!("access unit dropped ({} so far): {}", self.dropped, err));
        } else {
            self.muxer.debug(&format!("access unit dropped: {}", err));
        }
    }
}

impl PacketSink for PacketPipeline {
    fn on_packet(&mut self, packet: RtpPacket) -> Result<(), MuxError> {
        match self.extractor.push(&packet) {
            Ok(Some(unit)) => match self.muxer.write(unit) {
                Ok(()) => Ok(()),
                Err(e) if e.is_recoverable() => {
                    self.note_drop(&e);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Ok(None) => Ok(()),
            Err(e) => {
                self.muxer
                    .debug(&format!("packet {} skipped: {}", packet.sequence, e));
                Ok(())
            }
        }
    }
}

/// Records one camera until cancelled or failed.
pub struct RecordingWorker {
    camera: CameraDescriptor,
    muxer_config: MuxerConfig,
    notifier: Option<Sender<CompletedFile>>,
    reconnect: ReconnectConfig,
    stop_grace: Duration,
    state: watch::Sender<WorkerState>,
}

impl RecordingWorker {
    pub fn new(camera: CameraDescriptor, muxer_config: MuxerConfig) -> Self {
        let (state, _) = watch::channel(WorkerState::Initializing);
        Self {
            camera,
            muxer_config,
            notifier: None,
            reconnect: ReconnectConfig::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            state,
        }
    }

    pub fn with_notifier(mut self, notifier: Sender<CompletedFile>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// How long `play` may take to return after being asked to stop.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn camera(&self) -> &CameraDescriptor {
        &self.camera
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.debug(&format!("state -> {}", state));
        self.state.send_replace(state);
    }

    /// Runs until `cancel` fires or the session fails for good.
    /// `make_source` is called once per connection attempt.
    pub async fn run<S, F>(self, mut make_source: F, cancel: CancellationToken) -> WorkerReport
    where
        S: StreamSource,
        F: FnMut(&CameraDescriptor) -> S + Send,
    {
        let mut attempts = 0u32;
        let mut mux = MuxStats::default();
        let mut extract = ExtractStats::default();
        let mut backoff = Duration::from_millis(self.reconnect.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.reconnect.max_backoff_ms);

        self.info(&format!(
            "starting ({}, {} over {})",
            self.camera.location,
            self.camera.url.host_str().unwrap_or("?"),
            self.camera.transport
        ));

        let outcome = loop {
            attempts += 1;
            let mut source = make_source(&self.camera);
            let (result, stats) = self.record_once(&mut source, &cancel).await;
            accumulate(&mut mux, &mut extract, stats);

            let err = match result {
                Ok(()) => break Ok(()),
                Err(err) => err,
            };

            let retries_left = attempts <= self.reconnect.max_attempts;
            if cancel.is_cancelled() || !err.is_retryable() || !retries_left {
                break Err(err);
            }

            self.warn(&format!(
                "attempt {} failed: {}; reconnecting in {:?}",
                attempts, err, backoff
            ));
            self.set_state(WorkerState::Initializing);
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, max_backoff);
        };

        let state = match outcome {
            Ok(()) => {
                self.info("stopped");
                WorkerState::Stopped
            }
            Err(err) => {
                self.error(&format!("failed: {}", err));
                WorkerState::Failed(err.to_string())
            }
        };
        self.set_state(state.clone());

        WorkerReport {
            camera: self.camera.name.clone(),
            state,
            attempts,
            mux,
            extract,
        }
    }

    /// One session lifetime. The muxer is always closed, after ingestion
    /// has ended.
    async fn record_once<S: StreamSource>(
        &self,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> (Result<(), WorkerError>, Option<(MuxStats, ExtractStats)>) {
        let stopper = source.stopper();

        let media = tokio::select! {
            _ = cancel.cancelled() => None,
            r = source.connect() => Some(r),
        };
        let media = match media {
            Some(Ok(media)) => media,
            Some(Err(e)) => return (Err(e.into()), None),
            None => {
                source.stop();
                return (Ok(()), None);
            }
        };

        let configured = tokio::select! {
            _ = cancel.cancelled() => None,
            r = source.setup() => Some(r),
        };
        match configured {
            Some(Ok(())) => {}
            Some(Err(e)) => return (Err(e.into()), None),
            None => {
                source.stop();
                return (Ok(()), None);
            }
        }

        let mut muxer = SegmentMuxer::new(
            self.camera.name.clone(),
            self.camera.output_base.clone(),
            self.muxer_config,
        );
        if let Some(tx) = &self.notifier {
            muxer = muxer.with_notifier(tx.clone());
        }
        muxer.seed_parameter_sets(&media.parameter_sets);
        let mut pipeline = PacketPipeline::new(muxer);

        self.set_state(WorkerState::Recording);
        let played = {
            let play = source.play(&mut pipeline);
            tokio::pin!(play);

            tokio::select! {
                r = &mut play => r,
                _ = cancel.cancelled() => {
                    self.set_state(WorkerState::Stopping);
                    stopper.stop();
                    match tokio::time::timeout(self.stop_grace, &mut play).await {
                        Ok(r) => r,
                        Err(_) => {
                            self.warn("session did not stop in time, abandoning it");
                            Ok(())
                        }
                    }
                }
            }
        };

        // ingestion is over before the muxer is finalized
        source.stop();
        let (mut muxer, extract) = pipeline.into_parts();
        let closed = muxer.close();
        let stats = Some((muxer.stats(), extract));

        // a close failure is fatal even when the session failed first
        let result = match closed {
            Err(close_err) => {
                if let Err(e) = played {
                    self.warn(&format!("session error before close: {}", e));
                }
                self.error(&format!("closing segment failed: {}", close_err));
                Err(WorkerError::Mux(close_err))
            }
            Ok(()) => played.map_err(WorkerError::from),
        };
        (result, stats)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

fn accumulate(mux: &mut MuxStats, extract: &mut ExtractStats, stats: Option<(MuxStats, ExtractStats)>) {
    let Some((m, e)) = stats else {
        return;
    };
    mux.units_written += m.units_written;
    mux.units_dropped += m.units_dropped;
    mux.segments_completed += m.segments_completed;
    mux.bytes_written += m.bytes_written;
    extract.units += e.units;
    extract.skipped += e.skipped;
    extract.discarded += e.discarded;
    extract.errors += e.errors;
}

impl ComponentLogger for RecordingWorker {
    fn log_context(&self) -> LogContext {
        LogContext::new("worker", &self.camera.name)
    }
}
