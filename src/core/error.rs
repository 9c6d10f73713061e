use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;
pub type MuxResult<T> = Result<T, MuxError>;

/// Failures of the RTSP control/transport layer for one camera.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("camera unreachable at {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {target} timed out")]
    ConnectTimeout { target: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("no H264 video media offered (found: {offered})")]
    UnsupportedMedia { offered: String },
    #[error("invalid session state: {operation} requires {expected}, session is {actual}")]
    InvalidState {
        operation: &'static str,
        expected: &'static str,
        actual: String,
    },
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error("packet sink failed: {0}")]
    Sink(#[from] MuxError),
}

impl SessionError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Whether a fresh session might succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::ConnectTimeout { .. }
                | Self::Protocol { .. }
                | Self::Transport { .. }
        )
    }
}

/// Depacketization failures. Only the variants for which
/// [`ExtractError::is_transient`] is false are real decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("received a non-starting fragment without a preceding start")]
    NonStartingPacket,
    #[error("more packets needed to complete the access unit")]
    MorePacketsNeeded,
    #[error("empty RTP payload")]
    EmptyPayload,
    #[error("unsupported RTP/H264 packetization type {0}")]
    UnsupportedPacketType(u8),
    #[error("malformed {kind} packet: {detail}")]
    Malformed { kind: &'static str, detail: String },
    #[error("access unit exceeds {limit} {what}")]
    TooLarge { what: &'static str, limit: usize },
}

impl ExtractError {
    pub fn malformed(kind: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NonStartingPacket | Self::MorePacketsNeeded)
    }
}

/// Muxer failures. I/O is fatal for the camera, everything else drops a unit.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("cannot derive DTS: {0}")]
    Timestamp(String),
    #[error("IDR access unit received before SPS/PPS were seen")]
    MissingParameterSets,
    #[error("muxer already closed")]
    Closed,
    #[error("{context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MuxError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timestamp(_) | Self::MissingParameterSets)
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("session failed: {0}")]
    Session(SessionError),
    #[error("muxer failed: {0}")]
    Mux(MuxError),
}

impl From<SessionError> for WorkerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Sink(mux) => WorkerError::Mux(mux),
            other => WorkerError::Session(other),
        }
    }
}

impl From<MuxError> for WorkerError {
    fn from(err: MuxError) -> Self {
        WorkerError::Mux(err)
    }
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Session(err) => err.is_retryable(),
            WorkerError::Mux(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl ConfigError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
