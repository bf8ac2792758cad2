//! Crash-safe watermark tracking for one ingestion run.
//!
//! The tracker is a pure in-memory state machine: it is constructed from
//! the set of days discovered for this run, mutated only by the
//! aggregator task (single-writer discipline, no locking), and discarded
//! at run end. Only the derived cutoff survives, persisted as the
//! per-timeframe watermark.
//!
//! The core correctness property: the cutoff never advances past a day
//! that is still pending, even when later days settle first. Days absent
//! from the tracked set (weekends, holidays) are implicitly settled.

use std::collections::BTreeMap;

use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayState {
    Pending,
    Loaded,
    Failed,
}

impl DayState {
    fn is_settled(self) -> bool {
        !matches!(self, DayState::Pending)
    }
}

/// Tracks per-day load status and derives the watermark cutoff.
#[derive(Debug)]
pub struct DayTracker {
    days: BTreeMap<NaiveDate, DayState>,
    cutoff: NaiveDate,
}

impl DayTracker {
    /// Create a tracker over the days in scope for this run.
    ///
    /// `cutoff` is the previously persisted watermark; it only ever
    /// moves forward. Tracked days at or below the initial cutoff are
    /// already proven complete and are not re-tracked.
    pub fn new(days: impl IntoIterator<Item = NaiveDate>, cutoff: NaiveDate) -> Self {
        let days = days
            .into_iter()
            .filter(|day| *day > cutoff)
            .map(|day| (day, DayState::Pending))
            .collect();
        Self { days, cutoff }
    }

    /// Current watermark: every day at or below it is settled.
    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    /// Number of tracked days still pending.
    pub fn pending(&self) -> usize {
        self.days
            .values()
            .filter(|state| !state.is_settled())
            .count()
    }

    /// Mark a day as loaded. Idempotent: only a pending day transitions;
    /// redundant calls (or calls for untracked days) are no-ops.
    pub fn mark_loaded(&mut self, day: NaiveDate) {
        self.settle(day, DayState::Loaded);
    }

    /// Mark a day as failed. Failed days still settle the cutoff: the
    /// failure is recorded in the ledger, and the watermark must not
    /// stall behind a day that will never load without operator action.
    pub fn mark_failed(&mut self, day: NaiveDate) {
        self.settle(day, DayState::Failed);
    }

    fn settle(&mut self, day: NaiveDate, state: DayState) {
        if let Some(existing) = self.days.get_mut(&day) {
            if !existing.is_settled() {
                *existing = state;
                self.advance();
            }
        }
    }

    /// Advance the cutoff across settled and untracked days, stopping at
    /// the first pending day or past the last tracked day.
    fn advance(&mut self) {
        let Some(max_day) = self.days.keys().next_back().copied() else {
            return;
        };
        loop {
            let next = self
                .cutoff
                .succ_opt()
                .expect("cutoff never reaches NaiveDate::MAX");
            if next > max_day {
                break;
            }
            match self.days.get(&next) {
                Some(state) if !state.is_settled() => break,
                // Settled, or untracked (weekend/holiday): proven complete.
                _ => self.cutoff = next,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn days(range: std::ops::RangeInclusive<u32>) -> Vec<NaiveDate> {
        range.map(|d| date(2024, 5, d)).collect()
    }

    #[test]
    fn test_initial_cutoff_unchanged() {
        let tracker = DayTracker::new(days(2..=6), date(2024, 5, 1));
        assert_eq!(tracker.cutoff(), date(2024, 5, 1));
        assert_eq!(tracker.pending(), 5);
    }

    #[test]
    fn test_out_of_order_settlement() {
        // Scenario A: D2 settles first, cutoff must hold at D0 until D1
        // settles, then jump over the already-settled D2.
        let mut tracker = DayTracker::new(days(1..=5), date(2024, 4, 30));

        tracker.mark_loaded(date(2024, 5, 2));
        assert_eq!(tracker.cutoff(), date(2024, 4, 30));

        tracker.mark_loaded(date(2024, 5, 1));
        assert_eq!(tracker.cutoff(), date(2024, 5, 2));
    }

    #[test]
    fn test_gaps_do_not_block_advance() {
        // May 4-5 is a weekend with no published file.
        let mut tracker = DayTracker::new(
            vec![date(2024, 5, 3), date(2024, 5, 6)],
            date(2024, 5, 2),
        );
        tracker.mark_loaded(date(2024, 5, 3));
        assert_eq!(tracker.cutoff(), date(2024, 5, 3));
        tracker.mark_loaded(date(2024, 5, 6));
        assert_eq!(tracker.cutoff(), date(2024, 5, 6));
    }

    #[test]
    fn test_failed_days_settle() {
        let mut tracker = DayTracker::new(days(1..=3), date(2024, 4, 30));
        tracker.mark_failed(date(2024, 5, 1));
        assert_eq!(tracker.cutoff(), date(2024, 5, 1));
        tracker.mark_loaded(date(2024, 5, 2));
        tracker.mark_loaded(date(2024, 5, 3));
        assert_eq!(tracker.cutoff(), date(2024, 5, 3));
    }

    #[test]
    fn test_marks_are_idempotent() {
        let mut tracker = DayTracker::new(days(1..=2), date(2024, 4, 30));
        tracker.mark_loaded(date(2024, 5, 1));
        // A later failure report for an already-loaded day is a no-op.
        tracker.mark_failed(date(2024, 5, 1));
        tracker.mark_loaded(date(2024, 5, 1));
        assert_eq!(tracker.cutoff(), date(2024, 5, 1));
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_untracked_day_is_noop() {
        let mut tracker = DayTracker::new(days(1..=2), date(2024, 4, 30));
        tracker.mark_loaded(date(2024, 5, 20));
        assert_eq!(tracker.cutoff(), date(2024, 4, 30));
    }

    #[test]
    fn test_days_below_initial_cutoff_ignored() {
        let mut tracker = DayTracker::new(days(1..=5), date(2024, 5, 3));
        assert_eq!(tracker.pending(), 2);
        tracker.mark_loaded(date(2024, 5, 4));
        assert_eq!(tracker.cutoff(), date(2024, 5, 4));
    }

    #[test]
    fn test_cutoff_stops_at_last_tracked_day() {
        let mut tracker = DayTracker::new(days(1..=2), date(2024, 4, 30));
        tracker.mark_loaded(date(2024, 5, 1));
        tracker.mark_loaded(date(2024, 5, 2));
        // Cutoff lands on the scope's maximum day, not beyond it.
        assert_eq!(tracker.cutoff(), date(2024, 5, 2));
    }

    #[test]
    fn test_empty_day_set() {
        let mut tracker = DayTracker::new(Vec::new(), date(2024, 5, 1));
        tracker.mark_loaded(date(2024, 5, 2));
        assert_eq!(tracker.cutoff(), date(2024, 5, 1));
    }

    #[test]
    fn test_monotonicity_over_random_order() {
        // Settle ten days in a scrambled order; the cutoff must be
        // non-decreasing after every mark and complete at the end.
        let mut tracker = DayTracker::new(days(1..=10), date(2024, 4, 30));
        let order = [7u32, 3, 10, 1, 5, 2, 9, 4, 8, 6];
        let mut last = tracker.cutoff();
        for (i, d) in order.iter().enumerate() {
            if i % 2 == 0 {
                tracker.mark_loaded(date(2024, 5, *d));
            } else {
                tracker.mark_failed(date(2024, 5, *d));
            }
            assert!(tracker.cutoff() >= last, "cutoff moved backwards");
            last = tracker.cutoff();
        }
        assert_eq!(tracker.cutoff(), date(2024, 5, 10));
        assert_eq!(tracker.pending(), 0);
    }
}
