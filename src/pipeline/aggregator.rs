//! Aggregator task: the single consumer of worker outcomes.
//!
//! Exactly one aggregator runs per timeframe. It owns the
//! [`DayTracker`], applies every outcome to it, and periodically flushes
//! durable state: buffered failures into the ledger and the tracker's
//! cutoff into the persisted watermark. Because it is the only writer of
//! both, no cross-task coordination is needed beyond the result channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{self, BulkLoadPool};
use crate::emit;
use crate::error::PipelineError;
use crate::metrics::events::{CompressionTriggered, DaySettled, WatermarkAdvanced};
use crate::pipeline::{DayOutcome, FailureCollector};
use crate::timeframe::Timeframe;
use crate::tracker::DayTracker;

pub(crate) struct Aggregator {
    tracker: DayTracker,
    timeframe: Timeframe,
    pool: Arc<BulkLoadPool>,
    collector: Arc<FailureCollector>,
    flush_interval: Duration,
    compress_guard_days: u64,
    /// Watermark value already durable in the database.
    persisted: NaiveDate,
    days_loaded: u64,
    days_failed: u64,
    cancel: CancellationToken,
}

impl Aggregator {
    pub(crate) fn new(
        tracker: DayTracker,
        timeframe: Timeframe,
        pool: Arc<BulkLoadPool>,
        collector: Arc<FailureCollector>,
        flush_interval: Duration,
        compress_guard_days: u64,
        cancel: CancellationToken,
    ) -> Self {
        let persisted = tracker.cutoff();
        Self {
            tracker,
            timeframe,
            pool,
            collector,
            flush_interval,
            compress_guard_days,
            persisted,
            days_loaded: 0,
            days_failed: 0,
            cancel,
        }
    }

    /// Consume outcomes until the channel closes or the run is cancelled,
    /// then perform a final flush. Returns the final cutoff.
    ///
    /// A flush failure is fatal to the run: the token is cancelled so
    /// workers stop rather than keep loading days whose completion can no
    /// longer be recorded.
    pub(crate) async fn run(
        mut self,
        results: mpsc::UnboundedReceiver<DayOutcome>,
    ) -> Result<NaiveDate, PipelineError> {
        let result = self.run_inner(results).await;
        if let Err(error) = &result {
            error!(
                target = self.timeframe.name,
                error = %error,
                "Aggregator failed, cancelling run"
            );
            self.cancel.cancel();
        }
        result
    }

    async fn run_inner(
        &mut self,
        mut results: mpsc::UnboundedReceiver<DayOutcome>,
    ) -> Result<NaiveDate, PipelineError> {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = interval.tick() => {
                    self.flush().await?;
                }

                outcome = results.recv() => {
                    match outcome {
                        Some(outcome) => {
                            let advanced = self.apply(outcome);
                            if advanced {
                                self.flush().await?;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Drain anything still queued before the final flush so a fast
        // finish does not drop settled days.
        while let Ok(outcome) = results.try_recv() {
            self.apply(outcome);
        }
        self.flush().await?;
        info!(
            target = self.timeframe.name,
            days_loaded = self.days_loaded,
            days_failed = self.days_failed,
            pending = self.tracker.pending(),
            watermark = %self.tracker.cutoff(),
            "Run summary"
        );
        Ok(self.tracker.cutoff())
    }

    /// Apply one outcome to the tracker. Returns whether the cutoff moved.
    fn apply(&mut self, outcome: DayOutcome) -> bool {
        let before = self.tracker.cutoff();
        let failed = matches!(outcome, DayOutcome::Failed { .. });
        match &outcome {
            DayOutcome::Loaded(day) => self.tracker.mark_loaded(*day),
            DayOutcome::Failed { day, .. } => self.tracker.mark_failed(*day),
        }
        if failed {
            self.days_failed += 1;
        } else {
            self.days_loaded += 1;
        }
        emit!(DaySettled {
            failed,
            target: self.timeframe.name,
        });
        self.tracker.cutoff() > before
    }

    /// Persist buffered failures and, if the cutoff outran the durable
    /// watermark, the watermark itself.
    async fn flush(&mut self) -> Result<(), PipelineError> {
        let failures = self.collector.drain();
        if !failures.is_empty() {
            debug!(
                target = self.timeframe.name,
                count = failures.len(),
                "Recording failed files"
            );
            db::record_failed_files(self.pool.pool(), &failures).await?;
        }

        let cutoff = self.tracker.cutoff();
        if cutoff > self.persisted {
            db::persist_watermark(self.pool.pool(), self.timeframe.name, cutoff).await?;
            info!(target = self.timeframe.name, watermark = %cutoff, "Watermark advanced");
            emit!(WatermarkAdvanced {
                day: cutoff,
                target: self.timeframe.name,
            });
            self.persisted = cutoff;
            self.trigger_compression(cutoff);
        }
        Ok(())
    }

    /// Compress chunks now proven immutable. Runs detached: compression
    /// is an optimization and must never hold up or fail ingestion.
    fn trigger_compression(&self, watermark: NaiveDate) {
        let today = Utc::now().date_naive();
        let Some(boundary) = compression_boundary(today, self.compress_guard_days, watermark)
        else {
            return;
        };
        emit!(CompressionTriggered {
            target: self.timeframe.name,
        });
        let pool = self.pool.pool().clone();
        let table = self.timeframe.table;
        tokio::spawn(async move {
            match db::compress_chunks_older_than(&pool, table, boundary).await {
                Ok(chunks) => debug!(table, %boundary, chunks, "Compressed chunks"),
                Err(error) => warn!(table, %boundary, error = %error, "Chunk compression failed"),
            }
        });
    }
}

/// Everything strictly older than the returned day is safe to compress:
/// proven loaded (below the watermark) and past the recency guard.
fn compression_boundary(
    today: NaiveDate,
    guard_days: u64,
    watermark: NaiveDate,
) -> Option<NaiveDate> {
    let guarded = today.checked_sub_days(Days::new(guard_days))?;
    Some(guarded.min(watermark))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_boundary_limited_by_recency_guard() {
        // Watermark is current; the guard keeps recent chunks mutable.
        let boundary = compression_boundary(date(2024, 5, 20), 7, date(2024, 5, 20));
        assert_eq!(boundary, Some(date(2024, 5, 13)));
    }

    #[test]
    fn test_boundary_limited_by_watermark() {
        // Backfill in progress: never compress past proven-loaded data.
        let boundary = compression_boundary(date(2024, 5, 20), 7, date(2023, 1, 10));
        assert_eq!(boundary, Some(date(2023, 1, 10)));
    }
}
