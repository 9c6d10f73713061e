use std::fs;
use std::path::Path;

use bytes::Bytes;
use cam_stream_recorder::core::error::MuxError;
use cam_stream_recorder::h264::AccessUnit;
use cam_stream_recorder::recorder::{MuxerConfig, SegmentMuxer};
use cam_stream_recorder::testing::mocks::{TEST_PPS, TEST_SPS};

fn fixed_clock() -> u64 {
    1_700_000_000_000_000_000
}

fn idr(pts: i64, len: usize) -> AccessUnit {
    let mut slice = vec![0x88; len];
    slice[0] = 0x65;
    AccessUnit::new(
        pts,
        vec![
            Bytes::from_static(TEST_SPS),
            Bytes::from_static(TEST_PPS),
            Bytes::from(slice),
        ],
    )
}

fn non_idr(pts: i64, len: usize) -> AccessUnit {
    let mut slice = vec![0x88; len];
    slice[0] = 0x41;
    AccessUnit::new(pts, vec![Bytes::from(slice)])
}

fn ts_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".ts"))
        .collect();
    names.sort();
    names
}

#[test]
fn rotation_at_idr_boundary_yields_two_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut mux = SegmentMuxer::new(
        "cam",
        dir.path().join("cam"),
        MuxerConfig {
            max_segment_bytes: 2500,
            ..MuxerConfig::default()
        },
    )
    .with_clock(fixed_clock)
    .with_notifier(tx);

    mux.write(non_idr(0, 600))?;
    mux.write(non_idr(3000, 600))?;
    mux.write(idr(6000, 1500))?;
    mux.write(non_idr(9000, 600))?;
    assert!(rx.try_recv().is_err(), "no rotation between IDRs");

    mux.write(idr(12000, 1500))?;
    let first = rx.try_recv()?;
    assert_eq!(first.units, 2);

    mux.close()?;
    let second = rx.try_recv()?;
    assert_eq!(second.units, 1);

    let files = ts_files(dir.path());
    assert_eq!(files.len(), 2, "files: {:?}", files);
    assert!(files.iter().all(|n| !n.contains("_tmp")));
    for done in [&first, &second] {
        let data = fs::read(&done.path)?;
        assert_eq!(data.len() as u64, done.bytes);
        assert_eq!(data.len() % 188, 0);
        assert_eq!(data[0], 0x47);
    }
    Ok(())
}

#[test]
fn idr_before_parameter_sets_writes_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut mux = SegmentMuxer::new("cam", dir.path().join("cam"), MuxerConfig::default())
        .with_clock(fixed_clock);

    let mut slice = vec![0x88; 1500];
    slice[0] = 0x65;
    let err = mux
        .write(AccessUnit::new(1000, vec![Bytes::from(slice)]))
        .unwrap_err();
    assert!(matches!(err, MuxError::MissingParameterSets));
    assert_eq!(mux.stats().bytes_written, 0);

    mux.close()?;
    assert_eq!(fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn segment_names_carry_start_and_end_stamps() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut mux = SegmentMuxer::new("garage", dir.path().join("garage"), MuxerConfig::default())
        .with_clock(fixed_clock)
        .with_notifier(tx);

    mux.write(idr(0, 500))?;
    // 90 s later
    mux.write(non_idr(90 * 90_000, 500))?;
    mux.close()?;

    let done = rx.try_recv()?;
    assert_eq!(done.camera, "garage");
    assert_eq!(done.start_utc_ns, fixed_clock());
    assert_eq!(done.end_utc_ns, fixed_clock() + 90_000_000_000);

    let name = done.path.file_name().unwrap().to_string_lossy().into_owned();
    let parts: Vec<&str> = name.trim_end_matches(".ts").split('_').collect();
    assert_eq!(parts.len(), 3, "name: {}", name);
    assert_eq!(parts[0], "garage");
    assert_eq!(parts[1].len(), 14);
    assert_eq!(parts[2].len(), 14);
    assert!(parts[1] < parts[2]);
    Ok(())
}

#[test]
fn output_directory_is_created_on_first_write() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let nested = dir.path().join("a").join("b");
    let mut mux = SegmentMuxer::new("cam", nested.join("cam"), MuxerConfig::default())
        .with_clock(fixed_clock);

    assert!(!nested.exists());
    mux.write(idr(0, 100))?;
    assert!(nested.join("cam_tmp.ts").exists());
    mux.close()?;
    assert!(!nested.join("cam_tmp.ts").exists());
    assert_eq!(ts_files(&nested).len(), 1);
    Ok(())
}

fn muxer_with_threshold(
    dir: &Path,
    max_segment_bytes: u64,
) -> (SegmentMuxer, crossbeam_channel::Receiver<cam_stream_recorder::CompletedFile>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mux = SegmentMuxer::new(
        "cam",
        dir.join("cam"),
        MuxerConfig {
            max_segment_bytes,
            ..MuxerConfig::default()
        },
    )
    .with_clock(fixed_clock)
    .with_notifier(tx);
    (mux, rx)
}

#[test]
fn large_idr_does_not_close_segment_below_threshold() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut mux, rx) = muxer_with_threshold(dir.path(), 2500);

    mux.write(idr(0, 400))?;
    mux.write(non_idr(3000, 300))?;
    let before = mux.open_segment_bytes();
    assert!(before < 2500, "accumulated {}", before);

    // written on its own this keyframe would push the segment past the bound
    mux.write(idr(6000, 1500))?;
    assert!(rx.try_recv().is_err(), "rotated at {} bytes", before);
    assert!(mux.open_segment_bytes() >= 2500);

    mux.write(idr(9000, 400))?;
    let first = rx.try_recv()?;
    assert_eq!(first.units, 3);
    mux.close()?;
    assert_eq!(rx.try_recv()?.units, 1);
    Ok(())
}

#[test]
fn rotation_triggers_exactly_at_threshold() -> anyhow::Result<()> {
    let sizing_dir = tempfile::tempdir()?;
    let (mut sizing, _rx) = muxer_with_threshold(sizing_dir.path(), u64::MAX);
    sizing.write(idr(0, 700))?;
    sizing.write(non_idr(3000, 700))?;
    let accumulated = sizing.open_segment_bytes();
    sizing.close()?;

    let at = tempfile::tempdir()?;
    let (mut mux, rx) = muxer_with_threshold(at.path(), accumulated);
    mux.write(idr(0, 700))?;
    mux.write(non_idr(3000, 700))?;
    mux.write(idr(6000, 700))?;
    assert_eq!(rx.try_recv()?.units, 2);

    let below = tempfile::tempdir()?;
    let (mut mux, rx) = muxer_with_threshold(below.path(), accumulated + 1);
    mux.write(idr(0, 700))?;
    mux.write(non_idr(3000, 700))?;
    mux.write(idr(6000, 700))?;
    assert!(rx.try_recv().is_err());
    mux.close()?;
    assert_eq!(rx.try_recv()?.units, 3);
    Ok(())
}
