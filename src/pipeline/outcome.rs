//! Per-day outcomes flowing from workers to the aggregator.
//!
//! Workers never touch the tracker or the ledger directly: they push
//! immutable outcome values onto the shared result stream, and failures
//! additionally into the [`FailureCollector`], which the aggregator
//! drains on each flush. The collector's mutex exists purely for this
//! producer/consumer hand-off.

use std::sync::Mutex;

use chrono::NaiveDate;

/// Outcome of loading one trading day's file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOutcome {
    Loaded(NaiveDate),
    Failed { day: NaiveDate, reason: String },
}

impl DayOutcome {
    pub fn day(&self) -> NaiveDate {
        match self {
            DayOutcome::Loaded(day) => *day,
            DayOutcome::Failed { day, .. } => *day,
        }
    }
}

/// A persisted record of a file that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub day: NaiveDate,
    pub timeframe: &'static str,
    pub reason: String,
}

/// Shared buffer of failures awaiting persistence to the ledger.
#[derive(Debug, Default)]
pub struct FailureCollector {
    inner: Mutex<Vec<FailedFile>>,
}

impl FailureCollector {
    pub fn push(&self, failure: FailedFile) {
        self.lock().push(failure);
    }

    /// Take all buffered failures, leaving the collector empty.
    pub fn drain(&self) -> Vec<FailedFile> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FailedFile>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn test_outcome_day() {
        assert_eq!(DayOutcome::Loaded(date(1)).day(), date(1));
        let failed = DayOutcome::Failed {
            day: date(2),
            reason: "corrupt".to_string(),
        };
        assert_eq!(failed.day(), date(2));
    }

    #[test]
    fn test_collector_drains_once() {
        let collector = FailureCollector::default();
        collector.push(FailedFile {
            day: date(1),
            timeframe: "1m",
            reason: "bad".to_string(),
        });
        collector.push(FailedFile {
            day: date(2),
            timeframe: "1m",
            reason: "worse".to_string(),
        });

        let drained = collector.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].day, date(1));
        assert!(collector.drain().is_empty());
    }
}
