use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cam_stream_recorder::config::{CameraDescriptor, ReconnectConfig};
use cam_stream_recorder::core::error::{SessionError, SessionResult};
use cam_stream_recorder::h264::ParameterSets;
use cam_stream_recorder::recorder::MuxerConfig;
use cam_stream_recorder::rtp::RtpPacket;
use cam_stream_recorder::rtsp::{
    MediaDescription, PacketSink, SessionState, SessionStopper, StreamSource, TransportKind,
};
use cam_stream_recorder::testing::mocks::{
    test_parameter_sets, PacketScript, ScriptCounters, ScriptEnd, ScriptedSource,
};
use cam_stream_recorder::worker::{RecordingWorker, WorkerState};
use tokio_util::sync::CancellationToken;
use url::Url;

fn camera(dir: &Path, name: &str) -> CameraDescriptor {
    CameraDescriptor {
        name: name.into(),
        location: "test".into(),
        url: Url::parse("rtsp://127.0.0.1/stream").unwrap(),
        output_base: dir.join(name),
        transport: TransportKind::Tcp,
        upload_targets: Vec::new(),
    }
}

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[tokio::test]
async fn blocked_play_is_abandoned_and_muxer_closed_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default())
        .with_notifier(tx)
        .with_stop_grace(Duration::from_millis(200));
    let states = worker.subscribe();

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(100));

    let counters = Arc::new(ScriptCounters::default());
    let shared = counters.clone();

    let started = Instant::now();
    let report = worker
        .run(
            move |_: &CameraDescriptor| {
                ScriptedSource::new(PacketScript::default().packets(10), ScriptEnd::Hang)
                    .with_counters(shared.clone())
            },
            cancel,
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.state, WorkerState::Stopped);
    assert_eq!(*states.borrow(), WorkerState::Stopped);
    assert_eq!(report.mux.units_written, 10);
    assert_eq!(report.mux.segments_completed, 1);
    assert_eq!(counters.stops(), 1);

    let files: Vec<_> = rx.try_iter().collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].path.exists());
    assert!(!dir.path().join("cam_tmp.ts").exists());
    Ok(())
}

#[tokio::test]
async fn cooperative_stop_ends_cleanly() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let counters = Arc::new(ScriptCounters::default());
    let worker = RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default());

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(50));

    let shared = counters.clone();
    let report = worker
        .run(
            move |_: &CameraDescriptor| {
                ScriptedSource::new(PacketScript::default().packets(6), ScriptEnd::WaitForStop)
                    .with_counters(shared.clone())
            },
            cancel,
        )
        .await;

    assert_eq!(report.state, WorkerState::Stopped);
    assert_eq!(report.attempts, 1);
    assert_eq!(counters.plays(), 1);
    assert_eq!(counters.packets(), 6);
    Ok(())
}

#[tokio::test]
async fn closed_stream_fails_without_reconnect() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let worker =
        RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default()).with_notifier(tx);

    let report = worker
        .run(
            |_: &CameraDescriptor| ScriptedSource::new(PacketScript::default().packets(7), ScriptEnd::Close),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(report.state, WorkerState::Failed(_)));
    assert_eq!(report.attempts, 1);
    // what was recorded before the failure is kept
    assert_eq!(rx.try_iter().count(), 1);
    Ok(())
}

#[tokio::test]
async fn unreachable_camera_is_retried_with_backoff() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let counters = Arc::new(ScriptCounters::default());
    let worker = RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default())
        .with_reconnect(ReconnectConfig {
            max_attempts: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
        });

    let shared = counters.clone();
    let report = worker
        .run(
            move |_: &CameraDescriptor| ScriptedSource::unreachable().with_counters(shared.clone()),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(report.state, WorkerState::Failed(ref r) if r.contains("unreachable")));
    assert_eq!(report.attempts, 3);
    assert_eq!(counters.connects(), 3);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn cancel_during_backoff_stops_worker() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let worker = RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default())
        .with_reconnect(ReconnectConfig {
            max_attempts: 5,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        });

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(50));

    let started = Instant::now();
    let report = worker
        .run(|_: &CameraDescriptor| ScriptedSource::unreachable(), cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.state, WorkerState::Stopped);
    assert_eq!(report.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn announced_parameter_sets_allow_recording_without_in_band_ones() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let worker = RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default());
    let script = PacketScript {
        in_band_parameter_sets: false,
        ..PacketScript::default()
    };

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(50));

    let report = worker
        .run(
            move |_: &CameraDescriptor| {
                ScriptedSource::new(script.packets(5), ScriptEnd::WaitForStop)
                    .with_parameter_sets(test_parameter_sets())
            },
            cancel,
        )
        .await;

    assert_eq!(report.state, WorkerState::Stopped);
    assert_eq!(report.mux.units_written, 5);
    assert_eq!(report.mux.units_dropped, 0);
    Ok(())
}

#[tokio::test]
async fn end_of_stream_stops_worker_cleanly() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let worker =
        RecordingWorker::new(camera(dir.path(), "cam"), MuxerConfig::default()).with_notifier(tx);

    let report = worker
        .run(
            |_: &CameraDescriptor| {
                ScriptedSource::new(PacketScript::default().packets(8), ScriptEnd::EndOfStream)
            },
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.state, WorkerState::Stopped);
    assert_eq!(report.mux.units_written, 8);
    assert_eq!(rx.try_iter().count(), 1);
    Ok(())
}

fn retry_three_times() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
    }
}

#[tokio::test]
async fn unwritable_output_fails_without_reconnecting() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // a regular file where the output directory should be
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"")?;
    let mut cam = camera(dir.path(), "cam");
    cam.output_base = blocker.join("cam");

    let counters = Arc::new(ScriptCounters::default());
    let shared = counters.clone();
    let worker = RecordingWorker::new(cam, MuxerConfig::default()).with_reconnect(retry_three_times());

    let report = worker
        .run(
            move |_: &CameraDescriptor| {
                ScriptedSource::new(PacketScript::default().packets(5), ScriptEnd::WaitForStop)
                    .with_counters(shared.clone())
            },
            CancellationToken::new(),
        )
        .await;

    match &report.state {
        WorkerState::Failed(reason) => assert!(reason.contains("create_dir"), "reason: {}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.attempts, 1);
    assert_eq!(counters.connects(), 1);
    assert_eq!(report.mux.units_written, 0);
    assert_eq!(counters.stops(), 1);
    Ok(())
}

/// Delivers its packets, deletes the recording directory, then loses the
/// connection.
struct VanishingOutput {
    packets: Vec<RtpPacket>,
    output_dir: PathBuf,
    stopper: SessionStopper,
    state: SessionState,
}

#[async_trait]
impl StreamSource for VanishingOutput {
    async fn connect(&mut self) -> SessionResult<MediaDescription> {
        self.state = SessionState::Connected;
        Ok(MediaDescription {
            stream_index: 0,
            encoding: "H264".into(),
            clock_rate: 90_000,
            control: None,
            parameter_sets: ParameterSets::default(),
        })
    }

    async fn setup(&mut self) -> SessionResult<()> {
        self.state = SessionState::Configured;
        Ok(())
    }

    async fn play(&mut self, sink: &mut dyn PacketSink) -> SessionResult<()> {
        self.state = SessionState::Playing;
        for packet in std::mem::take(&mut self.packets) {
            sink.on_packet(packet)?;
        }
        std::fs::remove_dir_all(&self.output_dir)
            .map_err(|e| SessionError::transport(e.to_string()))?;
        let err = SessionError::transport("connection reset by camera");
        self.state = SessionState::Failed(err.to_string());
        Err(err)
    }

    fn stop(&mut self) {
        self.stopper.stop();
        if !self.state.is_terminal() {
            self.state = SessionState::Stopped;
        }
    }

    fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    fn state(&self) -> SessionState {
        self.state.clone()
    }
}

#[tokio::test]
async fn close_failure_outranks_retryable_session_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let output_dir = dir.path().join("out");
    let mut cam = camera(dir.path(), "cam");
    cam.output_base = output_dir.join("cam");

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = RecordingWorker::new(cam, MuxerConfig::default())
        .with_notifier(tx)
        .with_reconnect(retry_three_times());

    let report = worker
        .run(
            |_: &CameraDescriptor| VanishingOutput {
                packets: PacketScript::default().packets(5),
                output_dir: output_dir.clone(),
                stopper: SessionStopper::new(),
                state: SessionState::Created,
            },
            CancellationToken::new(),
        )
        .await;

    match &report.state {
        WorkerState::Failed(reason) => assert!(reason.contains("rename"), "reason: {}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.attempts, 1);
    assert_eq!(report.mux.units_written, 5);
    assert_eq!(report.mux.segments_completed, 0);
    assert!(rx.try_recv().is_err());
    Ok(())
}
