// src/lib.rs
pub mod config;
pub mod core;
pub mod h264;
pub mod mpegts;
pub mod orchestrator;
pub mod recorder;
pub mod rtp;
pub mod rtsp;
pub mod storage;
pub mod worker;

pub mod testing {
    pub mod mocks;
}

// Re-export der wichtigsten Typen
pub use config::{CameraDescriptor, Config, UploadTarget};
pub use crate::core::timestamp::utc_ns_now;
pub use crate::core::{ComponentLogger, LogContext};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use recorder::{CompletedFile, MuxerConfig, SegmentMuxer};
pub use rtsp::{RtspSession, StreamSource};
pub use worker::{RecordingWorker, WorkerReport, WorkerState};
