use bytes::Bytes;
use h264_reader::nal::UnitType;

use super::sps::SpsInfo;
use super::unit_type;
use crate::core::error::MuxError;

const MAX_REORDERED_FRAMES: i32 = 10;
/// One millisecond at 90 kHz.
const DTS_STEP: i64 = 90;

/// Derives decode timestamps from presentation timestamps and picture order.
///
/// Streams without reordering (POC type 2, or interlaced streams) decode in
/// presentation order, so DTS equals PTS. For POC type 0 the tracker follows
/// the expected picture order count and spreads the reorder delay over the
/// frames that follow an IDR.
#[derive(Debug, Default)]
pub struct DtsTracker {
    sps: Option<(Bytes, SpsInfo)>,
    expected_poc: u32,
    poc_increment: u32,
    reordered_frames: i32,
    pause_dts: i32,
    prev_dts: Option<i64>,
}

impl DtsTracker {
    pub fn new() -> Self {
        Self {
            poc_increment: 2,
            ..Default::default()
        }
    }

    /// Returns the DTS of the access unit. The result never exceeds `pts` and
    /// never goes below the DTS previously returned.
    pub fn extract(&mut self, nalus: &[Bytes], pts: i64) -> Result<i64, MuxError> {
        let dts = self.extract_inner(nalus, pts)?;

        if dts > pts {
            return Err(MuxError::Timestamp(format!(
                "DTS {} is greater than PTS {}",
                dts, pts
            )));
        }
        if let Some(prev) = self.prev_dts {
            if dts < prev {
                return Err(MuxError::Timestamp(format!(
                    "DTS is not monotonically increasing, was {}, now is {}",
                    prev, dts
                )));
            }
        }

        self.prev_dts = Some(dts);
        Ok(dts)
    }

    fn extract_inner(&mut self, nalus: &[Bytes], pts: i64) -> Result<i64, MuxError> {
        let mut idr = None;
        let mut non_idr = None;

        for nalu in nalus {
            match unit_type(nalu) {
                Some(UnitType::SeqParameterSet) => self.update_sps(nalu)?,
                Some(UnitType::SliceLayerWithoutPartitioningIdr) => idr = Some(nalu),
                Some(UnitType::SliceLayerWithoutPartitioningNonIdr) => non_idr = Some(nalu),
                _ => {}
            }
        }

        let sps = match &self.sps {
            Some((_, info)) => info.clone(),
            None => return Err(MuxError::Timestamp("SPS not received yet".into())),
        };

        if sps.pic_order_cnt_type != 0 || !sps.frame_mbs_only {
            return Ok(pts);
        }

        if idr.is_some() {
            self.expected_poc = 0;
            self.reordered_frames = 0;
            self.pause_dts = 0;
            self.poc_increment = 2;
            return Ok(pts);
        }

        let Some(non_idr) = non_idr else {
            return Err(MuxError::Timestamp(
                "access unit contains no coded slice".into(),
            ));
        };
        let Some(prev_dts) = self.prev_dts else {
            return Err(MuxError::Timestamp("no reference frame seen yet".into()));
        };

        let poc_mask = (1u32 << sps.log2_max_pic_order_cnt_lsb) - 1;
        self.expected_poc = (self.expected_poc + self.poc_increment) & poc_mask;

        if self.pause_dts > 0 {
            self.pause_dts -= 1;
            return Ok(prev_dts + DTS_STEP);
        }

        let poc = sps
            .slice_poc_lsb(non_idr)
            .ok_or_else(|| MuxError::Timestamp("unreadable slice header".into()))?;

        if self.poc_increment == 2 && poc % 2 != 0 {
            self.poc_increment = 1;
            self.expected_poc /= 2;
        }

        let poc_diff = wrapped_diff(poc, self.expected_poc, sps.log2_max_pic_order_cnt_lsb)
            / self.poc_increment as i32;
        let limit = -(self.reordered_frames + 1);

        // B-frames immediately following an IDR
        if poc_diff < limit {
            let increase = limit - poc_diff;
            if self.reordered_frames + increase > MAX_REORDERED_FRAMES {
                return Err(MuxError::Timestamp("too many reordered frames".into()));
            }
            self.reordered_frames += increase;
            self.pause_dts = increase;
            return Ok(prev_dts + DTS_STEP);
        }

        if poc_diff == 0 {
            return Ok(pts);
        }

        if self.reordered_frames == 0 && poc_diff == -1 {
            return Ok(pts);
        }

        let divisor = (poc_diff + self.reordered_frames + 1) as i64;
        if divisor <= 0 {
            return Ok(prev_dts.min(pts));
        }
        Ok(prev_dts + (pts - prev_dts) / divisor)
    }

    fn update_sps(&mut self, nalu: &Bytes) -> Result<(), MuxError> {
        if matches!(&self.sps, Some((raw, _)) if raw == nalu) {
            return Ok(());
        }
        let info = SpsInfo::parse(nalu)
            .map_err(|e| MuxError::Timestamp(format!("unable to parse SPS: {}", e)))?;
        self.sps = Some((nalu.clone(), info));
        Ok(())
    }
}

fn wrapped_diff(a: u32, b: u32, log2_max: u32) -> i32 {
    let max = 1i32 << log2_max;
    let mut d = a as i32 - b as i32;
    if d > max / 2 {
        d -= max;
    } else if d < -max / 2 {
        d += max;
    }
    d
}
