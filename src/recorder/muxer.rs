use std::path::PathBuf;

use crossbeam_channel::Sender;
use h264_reader::nal::UnitType;

use super::segment::Segment;
use super::{CompletedFile, MuxerConfig};
use crate::core::error::{MuxError, MuxResult};
use crate::core::logging::{ComponentLogger, LogContext};
use crate::core::timestamp::utc_ns_now;
use crate::h264::{unit_type, AccessUnit, DtsTracker, ParameterSetCache, ParameterSets};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub units_written: u64,
    pub units_dropped: u64,
    pub segments_completed: u64,
    pub bytes_written: u64,
}

/// Writes access units of one camera into size-bounded MPEG-TS segments.
///
/// Segments open lazily on the first writable unit and rotate only in
/// front of an IDR unit, so every file starts decodable. Finished files are
/// renamed after the wall-clock span they cover and announced on the
/// optional notifier channel.
pub struct SegmentMuxer {
    camera: String,
    base: PathBuf,
    config: MuxerConfig,
    params: ParameterSetCache,
    dts: Option<DtsTracker>,
    segment: Option<Segment>,
    next_index: u64,
    notifier: Option<Sender<CompletedFile>>,
    now: fn() -> u64,
    closed: bool,
    stats: MuxStats,
}

impl SegmentMuxer {
    /// `base` is the path prefix of every file, e.g. `/data/cam1`.
    pub fn new(camera: impl Into<String>, base: impl Into<PathBuf>, config: MuxerConfig) -> Self {
        Self {
            camera: camera.into(),
            base: base.into(),
            config,
            params: ParameterSetCache::new(),
            dts: None,
            segment: None,
            next_index: 1,
            notifier: None,
            now: utc_ns_now,
            closed: false,
            stats: MuxStats::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Sender<CompletedFile>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replaces the wall clock used to anchor each segment.
    pub fn with_clock(mut self, now: fn() -> u64) -> Self {
        self.now = now;
        self
    }

    pub fn seed_parameter_sets(&mut self, sets: &ParameterSets) {
        if sets.is_empty() {
            return;
        }
        self.params.seed(sets);
        self.debug("parameter sets seeded from session description");
    }

    pub fn parameter_sets(&self) -> &ParameterSetCache {
        &self.params
    }

    pub fn stats(&self) -> MuxStats {
        self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes in the currently open segment, 0 when none is open.
    pub fn open_segment_bytes(&self) -> u64 {
        self.segment.as_ref().map(|s| s.bytes_written()).unwrap_or(0)
    }

    /// Writes one access unit.
    ///
    /// [`MuxError::Timestamp`] and [`MuxError::MissingParameterSets`] drop the
    /// unit and leave the muxer usable. I/O errors are fatal.
    pub fn write(&mut self, unit: AccessUnit) -> MuxResult<()> {
        if self.closed {
            return Err(MuxError::Closed);
        }

        let pts = unit.pts;
        let mut nalus = Vec::with_capacity(unit.nalus.len() + 2);
        let mut idr = false;
        let mut coded = false;

        for nalu in unit.nalus {
            if nalu.is_empty() || self.params.update(&nalu) {
                continue;
            }
            match unit_type(&nalu) {
                Some(UnitType::AccessUnitDelimiter) => continue,
                Some(UnitType::SliceLayerWithoutPartitioningIdr) => {
                    idr = true;
                    coded = true;
                }
                Some(UnitType::SliceLayerWithoutPartitioningNonIdr) => coded = true,
                _ => {}
            }
            nalus.push(nalu);
        }

        if !coded {
            return Ok(());
        }

        if idr {
            let (Some(sps), Some(pps)) = (self.params.sps(), self.params.pps()) else {
                self.stats.units_dropped += 1;
                return Err(MuxError::MissingParameterSets);
            };
            let (sps, pps) = (sps.clone(), pps.clone());
            nalus.insert(0, pps);
            nalus.insert(0, sps);
        } else if self.dts.is_none() {
            // nothing decodable before the first IDR
            self.stats.units_dropped += 1;
            return Ok(());
        }

        let tracker = self.dts.get_or_insert_with(DtsTracker::new);
        let dts = match tracker.extract(&nalus, pts) {
            Ok(dts) => dts,
            Err(err) => {
                self.stats.units_dropped += 1;
                return Err(err);
            }
        };

        let max_bytes = self.config.max_segment_bytes;
        let rotate = idr
            && self
                .segment
                .as_ref()
                .is_some_and(|s| s.units() > 0 && s.bytes_written() >= max_bytes);
        if rotate {
            if let Some(segment) = self.segment.take() {
                self.finish_segment(segment)?;
            }
        }

        if self.segment.is_none() {
            let segment = self.open_segment()?;
            self.segment = Some(segment);
        }
        let now = (self.now)();
        let clock_rate = self.config.clock_rate;
        let Some(segment) = self.segment.as_mut() else {
            return Err(MuxError::Closed);
        };

        let written = segment.write(pts, dts, idr, &nalus, now, clock_rate)?;
        self.stats.units_written += 1;
        self.stats.bytes_written += written;
        Ok(())
    }

    /// Finalizes the open segment. Later calls are no-ops.
    pub fn close(&mut self) -> MuxResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.segment.take() {
            Some(segment) => self.finish_segment(segment),
            None => Ok(()),
        }
    }

    fn open_segment(&mut self) -> MuxResult<Segment> {
        if let Some(dir) = self.base.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| MuxError::io("create_dir", dir, e))?;
            }
        }

        let segment = Segment::create(&self.base, self.next_index)?;
        self.next_index += 1;
        self.debug(&format!("opened {}", segment.tmp_path().display()));
        Ok(segment)
    }

    fn finish_segment(&mut self, segment: Segment) -> MuxResult<()> {
        let index = segment.index();
        let Some(done) = segment.finish(&self.base, &self.camera)? else {
            self.debug(&format!("segment {} was empty, removed", index));
            return Ok(());
        };

        self.stats.segments_completed += 1;
        self.info(&format!(
            "segment {} complete: {} ({} bytes, {} units)",
            index,
            done.path.display(),
            done.bytes,
            done.units
        ));

        if let Some(tx) = &self.notifier {
            if tx.send(done).is_err() {
                self.debug("completion receiver gone, notification dropped");
            }
        }
        Ok(())
    }
}

impl ComponentLogger for SegmentMuxer {
    fn log_context(&self) -> LogContext {
        let ctx = LogContext::new("muxer", &self.camera);
        match &self.segment {
            Some(segment) => ctx.with_segment(segment.index()),
            None => ctx,
        }
    }
}

impl Drop for SegmentMuxer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close() {
            self.error(&format!("close on drop failed: {}", e));
        }
    }
}
