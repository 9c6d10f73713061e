//! Minimal MPEG-TS writer for a single H.264 program.
//!
//! ```text
//! PAT (PID 0x0000) -> PMT (PID 0x1000) -> H.264 elementary stream (PID 0x0100)
//! ```
//!
//! Tables are repeated in front of every random-access unit so each segment
//! and each GOP can be decoded on its own. Every access unit carries a PCR
//! in the adaptation field of its first packet.

use std::io::{self, Write};

use bytes::Bytes;

pub const TS_PACKET_SIZE: usize = 188;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;

const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const STREAM_TYPE_H264: u8 = 0x1B;
const VIDEO_STREAM_ID: u8 = 0xE0;
const PROGRAM_NUMBER: u16 = 1;
const TRANSPORT_STREAM_ID: u16 = 1;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
/// Length byte + flags + 6-byte PCR.
const PCR_ADAPTATION_SIZE: usize = 8;
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// Access unit delimiter, any primary picture type.
const AUD_NALU: [u8; 2] = [0x09, 0xF0];
const TIMESTAMP_MASK: u64 = (1 << 33) - 1;

/// Writes PAT/PMT tables and PES-packetized access units to `out`.
pub struct TsWriter<W: Write> {
    out: W,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
}

impl<W: Write> TsWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
        }
    }

    /// Writes one access unit and returns the number of bytes emitted.
    pub fn write_access_unit(
        &mut self,
        pts: i64,
        dts: i64,
        random_access: bool,
        nalus: &[Bytes],
    ) -> io::Result<u64> {
        let pes = build_pes(pts, dts, nalus);
        let mut buf = Vec::with_capacity(encoded_len(pes.len(), random_access) as usize);

        if random_access {
            self.write_tables(&mut buf);
        }
        self.packetize(&mut buf, &pes, dts as u64 & TIMESTAMP_MASK, random_access);

        self.out.write_all(&buf)?;
        Ok(buf.len() as u64)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_tables(&mut self, buf: &mut Vec<u8>) {
        let mut pat = vec![
            0x00, // table_id
            0xB0,
            0x0D,
            (TRANSPORT_STREAM_ID >> 8) as u8,
            TRANSPORT_STREAM_ID as u8,
            0xC1, // version 0, current
            0x00,
            0x00,
            (PROGRAM_NUMBER >> 8) as u8,
            PROGRAM_NUMBER as u8,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
        ];
        pat.extend_from_slice(&crc32_mpeg2(&pat).to_be_bytes());
        write_psi_packet(buf, PAT_PID, &mut self.pat_cc, &pat);

        let mut pmt = vec![
            0x02, // table_id
            0xB0,
            0x12,
            (PROGRAM_NUMBER >> 8) as u8,
            PROGRAM_NUMBER as u8,
            0xC1,
            0x00,
            0x00,
            0xE0 | (VIDEO_PID >> 8) as u8, // PCR PID
            VIDEO_PID as u8,
            0xF0,
            0x00,
            STREAM_TYPE_H264,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
        ];
        pmt.extend_from_slice(&crc32_mpeg2(&pmt).to_be_bytes());
        write_psi_packet(buf, PMT_PID, &mut self.pmt_cc, &pmt);
    }

    fn packetize(&mut self, buf: &mut Vec<u8>, pes: &[u8], pcr_base: u64, random_access: bool) {
        let mut offset = 0;
        let mut first = true;

        while offset < pes.len() {
            let mut adaptation = Vec::new();
            if first {
                let mut flags = 0x10; // PCR
                if random_access {
                    flags |= 0x40;
                }
                adaptation.push((PCR_ADAPTATION_SIZE - 1) as u8);
                adaptation.push(flags);
                adaptation.extend_from_slice(&encode_pcr(pcr_base));
            }

            let capacity = TS_PAYLOAD_SIZE - adaptation.len();
            let chunk = (pes.len() - offset).min(capacity);
            let stuffing = capacity - chunk;
            if stuffing > 0 {
                if adaptation.is_empty() {
                    adaptation.push((stuffing - 1) as u8);
                    if stuffing > 1 {
                        adaptation.push(0x00);
                        adaptation.resize(stuffing, 0xFF);
                    }
                } else {
                    adaptation[0] += stuffing as u8;
                    adaptation.resize(adaptation.len() + stuffing, 0xFF);
                }
            }

            let control = if adaptation.is_empty() { 0x10 } else { 0x30 };
            buf.push(SYNC_BYTE);
            buf.push(if first { 0x40 } else { 0x00 } | (VIDEO_PID >> 8) as u8);
            buf.push(VIDEO_PID as u8);
            buf.push(control | self.video_cc);
            self.video_cc = (self.video_cc + 1) & 0x0F;

            buf.extend_from_slice(&adaptation);
            buf.extend_from_slice(&pes[offset..offset + chunk]);

            offset += chunk;
            first = false;
        }
    }
}

/// Size on disk of a PES of `pes_len` bytes, including tables in front of
/// random-access units.
pub fn encoded_len(pes_len: usize, random_access: bool) -> u64 {
    let first_capacity = TS_PAYLOAD_SIZE - PCR_ADAPTATION_SIZE;
    let packets = if pes_len <= first_capacity {
        1
    } else {
        1 + (pes_len - first_capacity).div_ceil(TS_PAYLOAD_SIZE)
    };
    let tables = if random_access { 2 } else { 0 };
    ((packets + tables) * TS_PACKET_SIZE) as u64
}

fn pes_header_len(pts: i64, dts: i64) -> usize {
    if pts != dts { 19 } else { 14 }
}

fn annex_b_len(nalus: &[Bytes]) -> usize {
    START_CODE.len() + AUD_NALU.len() + nalus.iter().map(|n| START_CODE.len() + n.len()).sum::<usize>()
}

fn build_pes(pts: i64, dts: i64, nalus: &[Bytes]) -> Vec<u8> {
    let header_len = pes_header_len(pts, dts);
    let body_len = annex_b_len(nalus);
    let mut pes = Vec::with_capacity(header_len + body_len);

    pes.extend_from_slice(&[0x00, 0x00, 0x01, VIDEO_STREAM_ID]);
    let packet_len = header_len - 6 + body_len;
    let packet_len = if packet_len > u16::MAX as usize { 0 } else { packet_len as u16 };
    pes.extend_from_slice(&packet_len.to_be_bytes());
    pes.push(0x84); // data_alignment_indicator
    if pts != dts {
        pes.push(0xC0);
        pes.push(10);
        pes.extend_from_slice(&encode_timestamp(0x3, pts as u64));
        pes.extend_from_slice(&encode_timestamp(0x1, dts as u64));
    } else {
        pes.push(0x80);
        pes.push(5);
        pes.extend_from_slice(&encode_timestamp(0x2, pts as u64));
    }

    pes.extend_from_slice(&START_CODE);
    pes.extend_from_slice(&AUD_NALU);
    for nalu in nalus {
        pes.extend_from_slice(&START_CODE);
        pes.extend_from_slice(nalu);
    }
    pes
}

fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    let ts = ts & TIMESTAMP_MASK;
    [
        (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1,
        (ts >> 22) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
        (ts >> 7) as u8,
        (((ts & 0x7F) as u8) << 1) | 1,
    ]
}

fn encode_pcr(base: u64) -> [u8; 6] {
    let base = base & TIMESTAMP_MASK;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E,
        0x00,
    ]
}

fn write_psi_packet(buf: &mut Vec<u8>, pid: u16, cc: &mut u8, section: &[u8]) {
    let start = buf.len();
    buf.push(SYNC_BYTE);
    buf.push(0x40 | (pid >> 8) as u8);
    buf.push(pid as u8);
    buf.push(0x10 | *cc);
    *cc = (*cc + 1) & 0x0F;
    buf.push(0x00); // pointer_field
    buf.extend_from_slice(section);
    buf.resize(start + TS_PACKET_SIZE, 0xFF);
}

/// CRC-32/MPEG-2 as used by PSI sections.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
