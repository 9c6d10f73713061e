// src/core/logging.rs
use std::sync::atomic::{AtomicU64, Ordering};

use super::timestamp::utc_ns_now;

// Globale Sequenznummer für Korrelation
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub instance_id: String,
    pub segment: Option<u64>,
    pub sequence: u64,
    pub timestamp_ns: u64,
}

impl LogContext {
    pub fn new(component: &str, instance_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: instance_id.to_string(),
            segment: None,
            sequence: LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp_ns: utc_ns_now(),
        }
    }

    pub fn with_segment(mut self, index: u64) -> Self {
        self.segment = Some(index);
        self
    }

    pub fn format(&self, level: &str, message: &str) -> String {
        let segment_info = match self.segment {
            Some(index) => format!(" segment={}", index),
            None => String::new(),
        };

        format!(
            "[{}][seq={:06}][{}:{}{}] {}",
            level, self.sequence, self.component, self.instance_id, segment_info, message
        )
    }
}

/// Einheitliches Logging für langlebige Komponenten einer Kamera.
pub trait ComponentLogger {
    fn log_context(&self) -> LogContext;

    fn trace(&self, message: &str) {
        if log::log_enabled!(log::Level::Trace) {
            let ctx = self.log_context();
            log::trace!("{}", ctx.format("TRACE", message));
        }
    }

    fn debug(&self, message: &str) {
        if log::log_enabled!(log::Level::Debug) {
            let ctx = self.log_context();
            log::debug!("{}", ctx.format("DEBUG", message));
        }
    }

    fn info(&self, message: &str) {
        let ctx = self.log_context();
        log::info!("{}", ctx.format("INFO", message));
    }

    fn warn(&self, message: &str) {
        let ctx = self.log_context();
        log::warn!("{}", ctx.format("WARN", message));
    }

    fn error(&self, message: &str) {
        let ctx = self.log_context();
        log::error!("{}", ctx.format("ERROR", message));
    }
}
