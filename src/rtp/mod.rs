//! RTP payload (RFC 6184) to H.264 access unit depacketization.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::core::error::ExtractError;
use crate::h264::{AccessUnit, MAX_ACCESS_UNIT_SIZE, MAX_NALUS_PER_ACCESS_UNIT};

const STAP_A: u8 = 24;
const FU_A: u8 = 28;

/// One received RTP packet of the negotiated video stream, with its
/// timestamp already resolved to 90 kHz ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload: Bytes,
    pub pts: i64,
    pub marker: bool,
    pub sequence: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub units: u64,
    pub skipped: u64,
    pub discarded: u64,
    pub errors: u64,
}

/// Reassembles access units from single-NAL, STAP-A and FU-A payloads.
///
/// A unit is complete when a packet carries the marker bit. Fragments lost
/// to a sequence gap or a timestamp change are discarded.
#[derive(Debug, Default)]
pub struct AccessUnitExtractor {
    nalus: Vec<Bytes>,
    size: usize,
    pts: Option<i64>,
    fragment: BytesMut,
    fragment_active: bool,
    next_sequence: Option<u16>,
    stats: ExtractStats,
}

impl AccessUnitExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    /// Feeds one packet. Returns `Ok(None)` while a unit is incomplete or the
    /// packet could not start one; those two conditions are never errors.
    pub fn push(&mut self, packet: &RtpPacket) -> Result<Option<AccessUnit>, ExtractError> {
        match self.decode(packet) {
            Ok(unit) => {
                self.stats.units += 1;
                Ok(Some(unit))
            }
            Err(err) if err.is_transient() => {
                if err == ExtractError::NonStartingPacket {
                    self.stats.skipped += 1;
                }
                Ok(None)
            }
            Err(err) => {
                self.stats.errors += 1;
                self.reset_unit();
                Err(err)
            }
        }
    }

    fn decode(&mut self, packet: &RtpPacket) -> Result<AccessUnit, ExtractError> {
        if let Some(expected) = self.next_sequence {
            if packet.sequence != expected {
                self.drop_fragment();
            }
        }
        self.next_sequence = Some(packet.sequence.wrapping_add(1));

        if self.pts.is_some_and(|pts| pts != packet.pts) && !self.nalus.is_empty() {
            self.stats.discarded += 1;
            self.reset_unit();
        }
        self.pts = Some(packet.pts);

        let payload = &packet.payload;
        let Some(&header) = payload.first() else {
            return Err(ExtractError::EmptyPayload);
        };

        match header & 0x1F {
            1..=23 => {
                self.drop_fragment();
                self.push_nalu(payload.clone())?;
            }
            STAP_A => {
                self.drop_fragment();
                self.push_aggregate(payload)?;
            }
            FU_A => {
                if !self.push_fragment(payload)? {
                    return Err(ExtractError::MorePacketsNeeded);
                }
            }
            other => return Err(ExtractError::UnsupportedPacketType(other)),
        }

        if !packet.marker {
            return Err(ExtractError::MorePacketsNeeded);
        }

        let nalus = std::mem::take(&mut self.nalus);
        self.size = 0;
        Ok(AccessUnit::new(packet.pts, nalus))
    }

    fn push_aggregate(&mut self, payload: &Bytes) -> Result<(), ExtractError> {
        let mut offset = 1;
        let mut count = 0;
        while offset < payload.len() {
            if offset + 2 > payload.len() {
                return Err(ExtractError::malformed("STAP-A", "truncated size field"));
            }
            let size = BigEndian::read_u16(&payload[offset..]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                return Err(ExtractError::malformed(
                    "STAP-A",
                    format!("invalid NALU size {}", size),
                ));
            }
            self.push_nalu(payload.slice(offset..offset + size))?;
            offset += size;
            count += 1;
        }
        if count == 0 {
            return Err(ExtractError::malformed("STAP-A", "no NALUs"));
        }
        Ok(())
    }

    /// Returns true once the fragmented NAL unit is complete.
    fn push_fragment(&mut self, payload: &Bytes) -> Result<bool, ExtractError> {
        if payload.len() < 2 {
            return Err(ExtractError::malformed("FU-A", "missing FU header"));
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            if end {
                return Err(ExtractError::malformed("FU-A", "start and end bit both set"));
            }
            self.fragment.clear();
            self.fragment.extend_from_slice(&[(indicator & 0xE0) | (fu_header & 0x1F)]);
            self.fragment.extend_from_slice(&payload[2..]);
            self.fragment_active = true;
            return Ok(false);
        }

        if !self.fragment_active {
            return Err(ExtractError::NonStartingPacket);
        }

        if self.size + self.fragment.len() + payload.len() - 2 > MAX_ACCESS_UNIT_SIZE {
            self.drop_fragment();
            return Err(ExtractError::TooLarge {
                what: "bytes",
                limit: MAX_ACCESS_UNIT_SIZE,
            });
        }
        self.fragment.extend_from_slice(&payload[2..]);

        if !end {
            return Ok(false);
        }

        self.fragment_active = false;
        let nalu = self.fragment.split().freeze();
        self.push_nalu(nalu)?;
        Ok(true)
    }

    fn push_nalu(&mut self, nalu: Bytes) -> Result<(), ExtractError> {
        if self.nalus.len() >= MAX_NALUS_PER_ACCESS_UNIT {
            return Err(ExtractError::TooLarge {
                what: "NAL units",
                limit: MAX_NALUS_PER_ACCESS_UNIT,
            });
        }
        if self.size + nalu.len() > MAX_ACCESS_UNIT_SIZE {
            return Err(ExtractError::TooLarge {
                what: "bytes",
                limit: MAX_ACCESS_UNIT_SIZE,
            });
        }
        self.size += nalu.len();
        self.nalus.push(nalu);
        Ok(())
    }

    fn drop_fragment(&mut self) {
        if self.fragment_active {
            self.stats.discarded += 1;
        }
        self.fragment_active = false;
        self.fragment.clear();
    }

    fn reset_unit(&mut self) {
        self.drop_fragment();
        self.nalus.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16, pts: i64, marker: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            payload: Bytes::copy_from_slice(payload),
            pts,
            marker,
            sequence: seq,
        }
    }

    #[test]
    fn single_nal_packets_form_a_unit_on_marker() {
        let mut ex = AccessUnitExtractor::new();
        assert_eq!(ex.push(&pkt(1, 100, false, &[0x06, 0xAA])).unwrap(), None);
        let au = ex.push(&pkt(2, 100, true, &[0x65, 0xBB])).unwrap().unwrap();
        assert_eq!(au.pts, 100);
        assert_eq!(au.nalus.len(), 2);
        assert!(au.contains_idr());
    }

    #[test]
    fn stap_a_is_split() {
        let mut ex = AccessUnitExtractor::new();
        let payload = [24, 0x00, 0x02, 0x67, 0x01, 0x00, 0x02, 0x68, 0x02, 0x00, 0x02, 0x65, 0x03];
        let au = ex.push(&pkt(1, 0, true, &payload)).unwrap().unwrap();
        let types: Vec<u8> = au.nalus.iter().map(|n| n[0] & 0x1F).collect();
        assert_eq!(types, vec![7, 8, 5]);
    }

    #[test]
    fn malformed_stap_a_is_an_error() {
        let mut ex = AccessUnitExtractor::new();
        let err = ex.push(&pkt(1, 0, true, &[24, 0x00, 0x09, 0x67])).unwrap_err();
        assert!(matches!(err, ExtractError::Malformed { .. }));
    }

    #[test]
    fn fu_a_fragments_are_reassembled() {
        let mut ex = AccessUnitExtractor::new();
        // indicator: nri=3, type 28; header: start, type 5
        assert_eq!(ex.push(&pkt(10, 90, false, &[0x7C, 0x85, 1, 2])).unwrap(), None);
        assert_eq!(ex.push(&pkt(11, 90, false, &[0x7C, 0x05, 3])).unwrap(), None);
        let au = ex.push(&pkt(12, 90, true, &[0x7C, 0x45, 4])).unwrap().unwrap();
        assert_eq!(au.nalus.len(), 1);
        assert_eq!(au.nalus[0].as_ref(), &[0x65, 1, 2, 3, 4]);
    }

    #[test]
    fn continuation_without_start_is_skipped_not_fatal() {
        let mut ex = AccessUnitExtractor::new();
        assert_eq!(ex.push(&pkt(5, 0, false, &[0x7C, 0x05, 1])).unwrap(), None);
        assert_eq!(ex.push(&pkt(6, 0, true, &[0x7C, 0x45, 2])).unwrap(), None);
        assert_eq!(ex.stats().skipped, 2);
        assert_eq!(ex.stats().errors, 0);

        let au = ex.push(&pkt(7, 3000, true, &[0x41, 9])).unwrap();
        assert!(au.is_some());
    }

    #[test]
    fn sequence_gap_drops_partial_fragment() {
        let mut ex = AccessUnitExtractor::new();
        ex.push(&pkt(1, 0, false, &[0x7C, 0x85, 1])).unwrap();
        // packet 2 lost
        assert_eq!(ex.push(&pkt(3, 0, true, &[0x7C, 0x45, 3])).unwrap(), None);
        assert_eq!(ex.stats().discarded, 1);
    }

    #[test]
    fn unsupported_packetization_is_reported() {
        let mut ex = AccessUnitExtractor::new();
        let err = ex.push(&pkt(1, 0, true, &[25, 0, 0])).unwrap_err();
        assert_eq!(err, ExtractError::UnsupportedPacketType(25));
        assert!(!err.is_transient());
    }

    #[test]
    fn timestamp_change_discards_unterminated_unit() {
        let mut ex = AccessUnitExtractor::new();
        ex.push(&pkt(1, 0, false, &[0x41, 1])).unwrap();
        let au = ex.push(&pkt(2, 3000, true, &[0x41, 2])).unwrap().unwrap();
        assert_eq!(au.nalus.len(), 1);
        assert_eq!(au.pts, 3000);
        assert_eq!(ex.stats().discarded, 1);
    }

    #[test]
    fn too_many_nalus_is_rejected() {
        let mut ex = AccessUnitExtractor::new();
        for seq in 0..MAX_NALUS_PER_ACCESS_UNIT as u16 {
            assert_eq!(ex.push(&pkt(seq, 0, false, &[0x06, 0])).unwrap(), None);
        }
        let err = ex.push(&pkt(99, 0, true, &[0x41, 0])).unwrap_err();
        assert!(matches!(err, ExtractError::TooLarge { .. }));
    }
}
