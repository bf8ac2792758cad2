//! Internal events for icefall metrics emission.
//!
//! Each event struct represents a measurable occurrence in the ingestion
//! pipeline and emits the corresponding metric. The `target` label is the
//! timeframe name, enabling per-timeframe observability.

use chrono::{Datelike, NaiveDate};
use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a remote flat file has been fetched.
pub struct FileFetched {
    pub bytes: u64,
    /// Time spent on the remote fetch only, excluding decompression.
    pub duration: Duration,
    pub target: &'static str,
}

impl InternalEvent for FileFetched {
    fn emit(self) {
        trace!(bytes = self.bytes, target = self.target, "File fetched");
        counter!("icefall_bytes_fetched_total", "target" => self.target).increment(self.bytes);
        histogram!("icefall_fetch_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a batch finishes its whole-batch load.
pub struct BatchLoaded {
    pub files: usize,
    pub duration: Duration,
    pub target: &'static str,
}

impl InternalEvent for BatchLoaded {
    fn emit(self) {
        trace!(files = self.files, target = self.target, "Batch loaded");
        counter!("icefall_batches_loaded_total", "target" => self.target).increment(1);
        histogram!("icefall_batch_load_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted per settled day.
pub struct DaySettled {
    pub failed: bool,
    pub target: &'static str,
}

impl InternalEvent for DaySettled {
    fn emit(self) {
        let status = if self.failed { "failed" } else { "loaded" };
        counter!("icefall_days_total", "target" => self.target, "status" => status).increment(1);
    }
}

/// Event emitted when the persisted watermark advances.
pub struct WatermarkAdvanced {
    pub day: NaiveDate,
    pub target: &'static str,
}

impl InternalEvent for WatermarkAdvanced {
    fn emit(self) {
        trace!(day = %self.day, target = self.target, "Watermark advanced");
        gauge!("icefall_watermark_day", "target" => self.target)
            .set(self.day.num_days_from_ce() as f64);
    }
}

/// Event emitted when chunk compression is triggered.
pub struct CompressionTriggered {
    pub target: &'static str,
}

impl InternalEvent for CompressionTriggered {
    fn emit(self) {
        counter!("icefall_compression_triggered_total", "target" => self.target).increment(1);
    }
}
