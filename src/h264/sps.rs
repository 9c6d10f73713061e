use h264_reader::nal::UnitType;
use h264_reader::nal::sps::{FrameMbsFlags, PicOrderCntType, SeqParameterSet};
use h264_reader::rbsp::{BitRead, BitReader, decode_nal};

/// The parts of a sequence parameter set needed to locate
/// `pic_order_cnt_lsb` in a slice header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    pub separate_colour_plane: bool,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    /// Only meaningful when `pic_order_cnt_type == 0`.
    pub log2_max_pic_order_cnt_lsb: u32,
    pub frame_mbs_only: bool,
}

impl SpsInfo {
    /// Parses an SPS NAL unit (including its one-byte header).
    pub fn parse(nalu: &[u8]) -> Result<Self, String> {
        let rbsp = decode_nal(nalu).map_err(|e| e.to_string())?;
        let sps = SeqParameterSet::from_bits(BitReader::new(&*rbsp))
            .map_err(|e| format!("{:?}", e))?;

        let (pic_order_cnt_type, log2_max_pic_order_cnt_lsb) = match sps.pic_order_cnt {
            PicOrderCntType::TypeZero {
                log2_max_pic_order_cnt_lsb_minus4,
            } => (0, u32::from(log2_max_pic_order_cnt_lsb_minus4) + 4),
            PicOrderCntType::TypeOne { .. } => (1, 0),
            PicOrderCntType::TypeTwo => (2, 0),
        };

        Ok(Self {
            separate_colour_plane: sps.chroma_info.separate_colour_plane_flag,
            log2_max_frame_num: u32::from(sps.log2_max_frame_num_minus4) + 4,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb,
            frame_mbs_only: matches!(sps.frame_mbs_flags, FrameMbsFlags::Frames),
        })
    }

    /// Reads `pic_order_cnt_lsb` from a slice NAL unit. Only valid for
    /// `pic_order_cnt_type == 0`.
    pub fn slice_poc_lsb(&self, slice_nalu: &[u8]) -> Option<u32> {
        if self.pic_order_cnt_type != 0 {
            return None;
        }
        let is_idr = super::unit_type(slice_nalu)? == UnitType::SliceLayerWithoutPartitioningIdr;
        let rbsp = decode_nal(slice_nalu).ok()?;
        let mut r = BitReader::new(&*rbsp);

        r.read_ue("first_mb_in_slice").ok()?;
        r.read_ue("slice_type").ok()?;
        r.read_ue("pic_parameter_set_id").ok()?;
        if self.separate_colour_plane {
            r.read::<u8>(2, "colour_plane_id").ok()?;
        }
        r.read::<u16>(self.log2_max_frame_num, "frame_num").ok()?;
        if !self.frame_mbs_only && r.read_bool("field_pic_flag").ok()? {
            r.read_bool("bottom_field_flag").ok()?;
        }
        if is_idr {
            r.read_ue("idr_pic_id").ok()?;
        }
        r.read::<u16>(self.log2_max_pic_order_cnt_lsb, "pic_order_cnt_lsb")
            .ok()
            .map(u32::from)
    }
}
