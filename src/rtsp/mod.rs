// src/rtsp/mod.rs

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::error::{MuxError, SessionError, SessionResult};
use crate::h264::ParameterSets;
use crate::recorder::H264_CLOCK_RATE;
use crate::rtp::RtpPacket;

pub mod session;

pub use session::RtspSession;

pub const DEFAULT_RTSP_PORT: u16 = 554;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// The H264 video media selected from a camera's session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub stream_index: usize,
    pub encoding: String,
    pub clock_rate: u32,
    pub control: Option<String>,
    /// SPS/PPS announced out-of-band, if the camera sent any.
    pub parameter_sets: ParameterSets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    Configured,
    Playing,
    Stopped,
    Failed(String),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connected => "connected",
            SessionState::Configured => "configured",
            SessionState::Playing => "playing",
            SessionState::Stopped => "stopped",
            SessionState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }

    /// Errors unless the session is in `expected`.
    pub fn require(&self, operation: &'static str, expected: SessionState) -> SessionResult<()> {
        if *self == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                expected: expected.name(),
                actual: self.to_string(),
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Receives the RTP packets of the video stream while a session plays.
///
/// An error aborts playback; the session reports it as
/// [`SessionError::Sink`].
pub trait PacketSink: Send {
    fn on_packet(&mut self, packet: RtpPacket) -> Result<(), MuxError>;
}

/// Asks a playing session to return from `play`. Cloneable and usable from
/// any task while `play` holds the session.
#[derive(Debug, Clone, Default)]
pub struct SessionStopper {
    token: CancellationToken,
}

impl SessionStopper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// A camera stream: connect, set up the video media, then play into a sink
/// until stopped or failed.
#[async_trait]
pub trait StreamSource: Send {
    async fn connect(&mut self) -> SessionResult<MediaDescription>;

    async fn setup(&mut self) -> SessionResult<()>;

    /// Returns `Ok(())` when stopped through the [`SessionStopper`] or when
    /// the camera ends the stream.
    async fn play(&mut self, sink: &mut dyn PacketSink) -> SessionResult<()>;

    /// Ends the session from any state. Idempotent. While `play` runs, use
    /// the [`SessionStopper`] instead.
    fn stop(&mut self);

    fn stopper(&self) -> SessionStopper;

    fn state(&self) -> SessionState;
}

/// Maps extended RTP timestamps of one stream onto a 90 kHz PTS line that
/// starts at zero with the first packet.
#[derive(Debug, Clone)]
pub struct PtsClock {
    clock_rate: u32,
    anchor: Option<i64>,
}

impl PtsClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            anchor: None,
        }
    }

    /// Returns `None` for packets stamped before the first one seen.
    pub fn to_pts(&mut self, timestamp: i64) -> Option<i64> {
        let anchor = *self.anchor.get_or_insert(timestamp);
        let elapsed = timestamp - anchor;
        if elapsed < 0 || self.clock_rate == 0 {
            return None;
        }
        if self.clock_rate == H264_CLOCK_RATE {
            return Some(elapsed);
        }
        let pts = (elapsed as i128) * (H264_CLOCK_RATE as i128) / (self.clock_rate as i128);
        i64::try_from(pts).ok()
    }
}
