// src/recorder/mod.rs

use std::path::PathBuf;

pub mod muxer;
pub mod segment;

pub use muxer::{MuxStats, SegmentMuxer};
pub use segment::Segment;

pub const H264_CLOCK_RATE: u32 = 90_000;
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Fixed for the lifetime of a muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerConfig {
    /// Rotation threshold in bytes written to the container file.
    pub max_segment_bytes: u64,
    pub clock_rate: u32,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            clock_rate: H264_CLOCK_RATE,
        }
    }
}

/// Emitted once per finalized segment for the storage side to pick up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub camera: String,
    pub path: PathBuf,
    pub start_utc_ns: u64,
    pub end_utc_ns: u64,
    pub bytes: u64,
    pub units: u64,
}
