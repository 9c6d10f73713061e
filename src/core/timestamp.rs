use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

pub fn utc_ns_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() * NANOS_PER_SEC + d.subsec_nanos() as u64,
        Err(_) => 0,
    }
}

/// Converts a tick delta of a `clock_rate` Hz clock to nanoseconds.
///
/// Negative deltas clamp to zero: PTS is non-decreasing within a segment.
pub fn ticks_to_ns(ticks: i64, clock_rate: u32) -> u64 {
    if ticks <= 0 || clock_rate == 0 {
        return 0;
    }
    let ns = (ticks as i128) * (NANOS_PER_SEC as i128) / (clock_rate as i128);
    ns.min(u64::MAX as i128) as u64
}

/// Maps `pts` onto the wall clock anchored at (`anchor_pts`, `anchor_ns`).
pub fn pts_to_utc_ns(pts: i64, anchor_pts: i64, anchor_ns: u64, clock_rate: u32) -> u64 {
    anchor_ns.saturating_add(ticks_to_ns(pts - anchor_pts, clock_rate))
}

/// `YYYYMMDDHHMMSS` in local time, as used in finished segment names.
pub fn format_file_stamp(utc_ns: u64) -> String {
    let secs = (utc_ns / NANOS_PER_SEC) as i64;
    let nanos = (utc_ns % NANOS_PER_SEC) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(utc) => utc.with_timezone(&Local).format("%Y%m%d%H%M%S").to_string(),
        None => format!("{:014}", secs),
    }
}
