//! Metrics emission for the ingestion pipeline.
//!
//! Events are plain structs implementing [`InternalEvent`]; the `emit!`
//! macro keeps call sites terse. The `metrics` facade does the actual
//! recording, so the embedding service decides which exporter (if any)
//! is installed.

pub mod events;

/// Emit an internal event as a metric.
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
