//! H.264 elementary-stream building blocks: NAL classification, access
//! units, the parameter-set cache and the decode-timestamp tracker.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};

pub mod dts;
pub mod sps;

pub use dts::DtsTracker;
pub use sps::SpsInfo;

pub const MAX_ACCESS_UNIT_SIZE: usize = 8 * 1024 * 1024;
pub const MAX_NALUS_PER_ACCESS_UNIT: usize = 21;

/// Classifies a NAL unit by its header byte. `None` for an empty unit or a
/// set forbidden bit.
pub fn unit_type(nalu: &[u8]) -> Option<UnitType> {
    let header = NalHeader::new(*nalu.first()?).ok()?;
    Some(header.nal_unit_type())
}

/// NAL units sharing one presentation timestamp (90 kHz ticks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub pts: i64,
    pub nalus: Vec<Bytes>,
}

impl AccessUnit {
    pub fn new(pts: i64, nalus: Vec<Bytes>) -> Self {
        Self { pts, nalus }
    }

    pub fn contains_idr(&self) -> bool {
        self.nalus
            .iter()
            .any(|n| unit_type(n) == Some(UnitType::SliceLayerWithoutPartitioningIdr))
    }

    pub fn payload_len(&self) -> usize {
        self.nalus.iter().map(|n| n.len()).sum()
    }
}

/// Most recent SPS and PPS seen on a stream. Survives segment rotation.
#[derive(Debug, Clone, Default)]
pub struct ParameterSetCache {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `nalu` if it is an SPS or PPS. Returns true when it was one.
    pub fn update(&mut self, nalu: &Bytes) -> bool {
        match unit_type(nalu) {
            Some(UnitType::SeqParameterSet) => {
                self.sps = Some(nalu.clone());
                true
            }
            Some(UnitType::PicParameterSet) => {
                self.pps = Some(nalu.clone());
                true
            }
            _ => false,
        }
    }

    pub fn seed(&mut self, sets: &ParameterSets) {
        if let Some(sps) = &sets.sps {
            self.sps = Some(sps.clone());
        }
        if let Some(pps) = &sets.pps {
            self.pps = Some(pps.clone());
        }
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}

/// Parameter sets announced out-of-band, e.g. in the session description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    pub fn is_empty(&self) -> bool {
        self.sps.is_none() && self.pps.is_none()
    }
}

/// Extracts the first SPS and PPS from an AVCDecoderConfigurationRecord.
pub fn parse_avcc(record: &[u8]) -> Option<ParameterSets> {
    let mut c = Cursor::new(record);

    let version = c.read_u8().ok()?;
    if version != 1 {
        return None;
    }
    // profile, compatibility, level, length size
    let mut skip = [0u8; 4];
    c.read_exact(&mut skip).ok()?;

    let mut sets = ParameterSets::default();

    let num_sps = c.read_u8().ok()? & 0x1F;
    for i in 0..num_sps {
        let nalu = read_length_prefixed(&mut c)?;
        if i == 0 {
            sets.sps = Some(nalu);
        }
    }

    let num_pps = c.read_u8().ok()?;
    for i in 0..num_pps {
        let nalu = read_length_prefixed(&mut c)?;
        if i == 0 {
            sets.pps = Some(nalu);
        }
    }

    Some(sets)
}

fn read_length_prefixed(c: &mut Cursor<&[u8]>) -> Option<Bytes> {
    let len = c.read_u16::<BigEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    c.read_exact(&mut buf).ok()?;
    Some(Bytes::from(buf))
}
