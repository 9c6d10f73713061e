use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::error::{SessionError, SessionResult};
use crate::core::lock::lock_mutex;
use crate::h264::ParameterSets;
use crate::recorder::H264_CLOCK_RATE;
use crate::rtp::RtpPacket;
use crate::rtsp::{MediaDescription, PacketSink, SessionState, SessionStopper, StreamSource};

/// Baseline profile SPS, POC type 2, 4-bit frame_num.
pub const TEST_SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xF6, 0x40];
pub const TEST_PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

/// What a [`ScriptedSource`] does once its packets are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEnd {
    /// Connection drops: `play` fails with a transport error.
    Close,
    /// Camera ends the stream: `play` returns `Ok(())`.
    EndOfStream,
    /// `play` waits for the stopper and then returns `Ok(())`.
    WaitForStop,
    /// `play` never returns, not even when stopped.
    Hang,
}

#[derive(Debug, Default)]
pub struct ScriptCounters {
    pub connects: AtomicU32,
    pub setups: AtomicU32,
    pub plays: AtomicU32,
    pub stops: AtomicU32,
    pub packets: AtomicU64,
}

impl ScriptCounters {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn plays(&self) -> u32 {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::SeqCst)
    }
}

/// Deterministic [`StreamSource`] that replays prepared RTP packets.
pub struct ScriptedSource {
    packets: Vec<RtpPacket>,
    end: ScriptEnd,
    unreachable: bool,
    parameter_sets: ParameterSets,
    state: Arc<Mutex<SessionState>>,
    stopper: SessionStopper,
    counters: Arc<ScriptCounters>,
}

impl ScriptedSource {
    pub fn new(packets: Vec<RtpPacket>, end: ScriptEnd) -> Self {
        Self {
            packets,
            end,
            unreachable: false,
            parameter_sets: ParameterSets::default(),
            state: Arc::new(Mutex::new(SessionState::Created)),
            stopper: SessionStopper::new(),
            counters: Arc::new(ScriptCounters::default()),
        }
    }

    /// `connect` fails as if nothing listened on the camera port.
    pub fn unreachable() -> Self {
        let mut source = Self::new(Vec::new(), ScriptEnd::Close);
        source.unreachable = true;
        source
    }

    pub fn with_counters(mut self, counters: Arc<ScriptCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Announce SPS/PPS out-of-band in the media description.
    pub fn with_parameter_sets(mut self, sets: ParameterSets) -> Self {
        self.parameter_sets = sets;
        self
    }

    pub fn counters(&self) -> Arc<ScriptCounters> {
        self.counters.clone()
    }

    fn set_state(&self, state: SessionState) {
        *lock_mutex(&self.state, "scripted source") = state;
    }

    fn require(&self, operation: &'static str, expected: SessionState) -> SessionResult<()> {
        lock_mutex(&self.state, "scripted source").require(operation, expected)
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn connect(&mut self) -> SessionResult<MediaDescription> {
        self.require("connect", SessionState::Created)?;
        self.counters.connects.fetch_add(1, Ordering::SeqCst);

        if self.unreachable {
            let err = SessionError::Unreachable {
                target: "scripted:554".into(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            };
            self.set_state(SessionState::Failed(err.to_string()));
            return Err(err);
        }

        self.set_state(SessionState::Connected);
        Ok(MediaDescription {
            stream_index: 0,
            encoding: "h264".into(),
            clock_rate: H264_CLOCK_RATE,
            control: None,
            parameter_sets: self.parameter_sets.clone(),
        })
    }

    async fn setup(&mut self) -> SessionResult<()> {
        self.require("setup", SessionState::Connected)?;
        self.counters.setups.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Configured);
        Ok(())
    }

    async fn play(&mut self, sink: &mut dyn PacketSink) -> SessionResult<()> {
        self.require("play", SessionState::Configured)?;
        self.counters.plays.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Playing);

        for packet in std::mem::take(&mut self.packets) {
            if self.stopper.is_stopped() && self.end != ScriptEnd::Hang {
                self.set_state(SessionState::Stopped);
                return Ok(());
            }
            if let Err(e) = sink.on_packet(packet) {
                let err = SessionError::Sink(e);
                self.set_state(SessionState::Failed(err.to_string()));
                return Err(err);
            }
            self.counters.packets.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }

        match self.end {
            ScriptEnd::Close => {
                let err = SessionError::transport("connection reset by camera");
                self.set_state(SessionState::Failed(err.to_string()));
                Err(err)
            }
            ScriptEnd::EndOfStream => {
                self.set_state(SessionState::Stopped);
                Ok(())
            }
            ScriptEnd::WaitForStop => {
                self.stopper.stopped().await;
                self.set_state(SessionState::Stopped);
                Ok(())
            }
            ScriptEnd::Hang => std::future::pending().await,
        }
    }

    fn stop(&mut self) {
        self.stopper.stop();
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        let mut state = lock_mutex(&self.state, "scripted source");
        if !state.is_terminal() {
            *state = SessionState::Stopped;
        }
    }

    fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    fn state(&self) -> SessionState {
        lock_mutex(&self.state, "scripted source").clone()
    }
}

/// Builds single-NAL RTP packets for a run of access units.
///
/// Every `gop` units starts with SPS, PPS and an IDR slice; the rest are
/// P slices. Slices carry `slice_len` bytes, PTS advances by `pts_step`.
#[derive(Debug, Clone)]
pub struct PacketScript {
    pub gop: usize,
    pub slice_len: usize,
    pub pts_step: i64,
    pub in_band_parameter_sets: bool,
}

impl Default for PacketScript {
    fn default() -> Self {
        Self {
            gop: 5,
            slice_len: 1000,
            pts_step: 3000,
            in_band_parameter_sets: true,
        }
    }
}

impl PacketScript {
    pub fn packets(&self, units: usize) -> Vec<RtpPacket> {
        let mut out = Vec::new();
        let mut sequence = 0u16;
        let mut push = |payload: Bytes, pts: i64, marker: bool| {
            out.push(RtpPacket {
                payload,
                pts,
                marker,
                sequence,
            });
            sequence = sequence.wrapping_add(1);
        };

        for i in 0..units {
            let pts = i as i64 * self.pts_step;
            let gop = self.gop.max(1);
            if i % gop == 0 {
                if self.in_band_parameter_sets {
                    push(Bytes::from_static(TEST_SPS), pts, false);
                    push(Bytes::from_static(TEST_PPS), pts, false);
                }
                push(slice(0x65, self.slice_len), pts, true);
            } else {
                push(slice(0x41, self.slice_len), pts, true);
            }
        }
        out
    }
}

pub fn test_parameter_sets() -> ParameterSets {
    ParameterSets {
        sps: Some(Bytes::from_static(TEST_SPS)),
        pps: Some(Bytes::from_static(TEST_PPS)),
    }
}

fn slice(header: u8, len: usize) -> Bytes {
    let mut data = vec![0x88; len.max(2)];
    data[0] = header;
    Bytes::from(data)
}
