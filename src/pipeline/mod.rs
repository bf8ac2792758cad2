//! Pipeline orchestration: discovery, worker fan-out, aggregation, and
//! post-run maintenance.
//!
//! Timeframes run strictly sequentially; within a timeframe, a pool of
//! workers loads batches concurrently while a single aggregator owns all
//! mutable run state. A cancellation token links the two: a fatal error
//! on either side cancels the other, and the final flush still runs so
//! every settled day is persisted.

mod aggregator;
mod outcome;
mod worker;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{Months, NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, BulkLoadPool};
use crate::error::PipelineError;
use crate::source::FlatFileStore;
use crate::timeframe::{FLAT_FILE_SUFFIX, Timeframe, parse_day_from_key};
use crate::tracker::DayTracker;

use aggregator::Aggregator;

pub use outcome::{DayOutcome, FailedFile, FailureCollector};

/// One end-to-end ingestion run over the configured timeframes.
pub struct Pipeline {
    config: Config,
    store: FlatFileStore,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let store = FlatFileStore::from_config(&config.object_store)?;
        Ok(Self { config, store })
    }

    /// Build a pipeline over an existing store (tests use the in-memory
    /// backend).
    pub fn with_store(config: Config, store: FlatFileStore) -> Self {
        Self { config, store }
    }

    /// Run to completion.
    pub async fn run(self) -> Result<(), PipelineError> {
        self.run_with_shutdown(CancellationToken::new()).await
    }

    /// Run until completion or until `shutdown` fires. On shutdown the
    /// current flush completes and the watermark reflects every settled
    /// day, so the next run resumes from there.
    pub async fn run_with_shutdown(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let pool =
            Arc::new(BulkLoadPool::connect(&self.config.db, self.config.ingest.workers).await?);

        let mut result = Ok(());
        for timeframe in &self.config.timeframes {
            if shutdown.is_cancelled() {
                info!(target = timeframe.name, "Shutdown requested, skipping timeframe");
                break;
            }
            if let Err(error) = self
                .run_timeframe(Arc::clone(&pool), timeframe, &shutdown)
                .await
            {
                result = Err(error);
                break;
            }
        }

        pool.close().await;
        result
    }

    async fn run_timeframe(
        &self,
        pool: Arc<BulkLoadPool>,
        timeframe: &Timeframe,
        shutdown: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let today = Utc::now().date_naive();
        let persisted = db::read_watermark(pool.pool(), timeframe.name).await?;
        let (cutoff, cold_start) =
            start_state(persisted, today, self.config.ingest.backfill_years);
        info!(
            target = timeframe.name,
            watermark = %cutoff,
            cold_start,
            "Starting timeframe ingestion"
        );

        let keys = self.discover(timeframe, cutoff, today).await?;
        if keys.is_empty() {
            info!(target = timeframe.name, "No new files, timeframe up to date");
            return Ok(());
        }
        info!(target = timeframe.name, files = keys.len(), "Discovered files to ingest");

        if cold_start {
            db::drop_secondary_indexes(pool.pool(), timeframe).await?;
        }

        let days: Vec<NaiveDate> = keys.iter().filter_map(|k| parse_day_from_key(k)).collect();
        let tracker = DayTracker::new(days, cutoff);
        let batches = partition_batches(keys, timeframe.batch_size);
        let queue: worker::BatchQueue = Arc::new(Mutex::new(VecDeque::from(batches)));
        let collector = Arc::new(FailureCollector::default());
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        // Child of the shutdown token: external shutdown cancels the
        // run, an internal fatal error cancels only this timeframe.
        let cancel = shutdown.child_token();

        let aggregator = Aggregator::new(
            tracker,
            timeframe.clone(),
            Arc::clone(&pool),
            Arc::clone(&collector),
            self.config.ingest.flush_interval,
            self.config.ingest.compress_guard_days as u64,
            cancel.clone(),
        );
        let aggregator_handle = tokio::spawn(aggregator.run(result_rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.config.ingest.workers {
            workers.spawn(worker::run_worker(
                Arc::clone(&pool),
                self.store.clone(),
                timeframe.clone(),
                self.config.ingest.fetch_timeout,
                Arc::clone(&queue),
                result_tx.clone(),
                Arc::clone(&collector),
                cancel.clone(),
            ));
        }
        // Workers hold the only senders now; the channel closes when the
        // last worker exits and the aggregator sees the end of stream.
        drop(result_tx);

        let mut first_error: Option<PipelineError> = None;
        while let Some(joined) = workers.join_next().await {
            let worker_result = match joined {
                Ok(result) => result,
                Err(source) => Err(PipelineError::TaskJoin { source }),
            };
            if let Err(error) = worker_result {
                if first_error.is_none() {
                    // Stop the other workers; the aggregator drains and
                    // flushes what already settled.
                    cancel.cancel();
                    first_error = Some(error);
                }
            }
        }

        let aggregated = match aggregator_handle.await {
            Ok(result) => result,
            Err(source) => Err(PipelineError::TaskJoin { source }),
        };
        let final_cutoff = match aggregated {
            Ok(cutoff) => Some(cutoff),
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
                None
            }
        };

        match first_error {
            None => {
                self.finish_maintenance(&pool, timeframe).await?;
                if let Some(cutoff) = final_cutoff {
                    info!(
                        target = timeframe.name,
                        watermark = %cutoff,
                        "Timeframe ingestion complete"
                    );
                }
                Ok(())
            }
            Some(error) => {
                // Best effort only: the original error is what matters.
                if let Err(cleanup) = self.finish_maintenance(&pool, timeframe).await {
                    warn!(
                        target = timeframe.name,
                        error = %cleanup,
                        "Post-failure maintenance incomplete"
                    );
                }
                Err(error)
            }
        }
    }

    /// List every remote file strictly newer than the cutoff, up to today.
    async fn discover(
        &self,
        timeframe: &Timeframe,
        cutoff: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<String>, PipelineError> {
        let Some(from) = cutoff.succ_opt() else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        for prefix in timeframe.month_prefixes(from, today) {
            for key in self.store.list_prefix(&prefix).await? {
                if !key.ends_with(FLAT_FILE_SUFFIX) {
                    continue;
                }
                match parse_day_from_key(&key) {
                    Some(day) if day > cutoff && day <= today => keys.push(key),
                    _ => {}
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Always runs at the end of a timeframe, success or not: indexes
    /// back in place, fresh statistics, no orphaned staging tables.
    async fn finish_maintenance(
        &self,
        pool: &BulkLoadPool,
        timeframe: &Timeframe,
    ) -> Result<(), PipelineError> {
        db::create_secondary_indexes(pool.pool(), timeframe).await?;
        db::analyze_table(pool.pool(), timeframe.table).await?;
        db::drop_leftover_staging(pool.pool(), timeframe.table).await?;
        Ok(())
    }
}

/// Initial cutoff for a run. No persisted watermark means a cold start:
/// the cutoff is placed `backfill_years` before today, and the run gets
/// the drop-indexes-first treatment.
fn start_state(
    persisted: Option<NaiveDate>,
    today: NaiveDate,
    backfill_years: u32,
) -> (NaiveDate, bool) {
    match persisted {
        Some(day) => (day, false),
        None => {
            let start = today
                .checked_sub_months(Months::new(backfill_years * 12))
                .unwrap_or(NaiveDate::MIN);
            (start, true)
        }
    }
}

/// Split sorted keys into contiguous fixed-size batches.
fn partition_batches(keys: Vec<String>, batch_size: usize) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    keys.chunks(batch_size).map(<[String]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbConfig, IngestConfig, ObjectStoreConfig};
    use crate::timeframe::default_timeframes;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{ObjectStore, PutPayload};
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_start_state_warm() {
        let (cutoff, cold) = start_state(Some(date(2024, 5, 1)), date(2024, 5, 20), 5);
        assert_eq!(cutoff, date(2024, 5, 1));
        assert!(!cold);
    }

    #[test]
    fn test_start_state_cold() {
        let (cutoff, cold) = start_state(None, date(2024, 5, 20), 5);
        assert_eq!(cutoff, date(2019, 5, 20));
        assert!(cold);
    }

    #[test]
    fn test_partition_batches_sizes() {
        let keys: Vec<String> = (0..7).map(|i| format!("k{i}")).collect();
        let batches = partition_batches(keys, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2], vec!["k6".to_string()]);
    }

    #[test]
    fn test_partition_batches_zero_size_clamped() {
        let batches = partition_batches(vec!["a".to_string()], 0);
        assert_eq!(batches.len(), 1);
    }

    fn test_config() -> Config {
        Config {
            object_store: ObjectStoreConfig {
                endpoint: None,
                bucket: "flatfiles".to_string(),
                region: "us-east-1".to_string(),
                access_key_id: "k".to_string(),
                secret_access_key: "s".to_string(),
            },
            db: DbConfig {
                url: "postgres://localhost/bars".to_string(),
                work_mem: "256MB".to_string(),
                statement_timeout: Duration::from_secs(600),
                acquire_timeout: Duration::from_secs(30),
            },
            ingest: IngestConfig {
                workers: 2,
                backfill_years: 5,
                fetch_timeout: Duration::from_secs(5),
                flush_interval: Duration::from_secs(30),
                compress_guard_days: 7,
            },
            timeframes: default_timeframes(),
        }
    }

    #[tokio::test]
    async fn test_discover_filters_cutoff_and_future() {
        let inner = InMemory::new();
        let root = "us_stocks_sip/minute_aggs_v1";
        for key in [
            format!("{root}/2024/05/2024-05-06.csv.gz"),
            format!("{root}/2024/05/2024-05-07.csv.gz"),
            format!("{root}/2024/05/2024-05-08.csv.gz"),
            // Not a day file: must be skipped.
            format!("{root}/2024/05/manifest.json"),
            // Published ahead of "today": out of scope.
            format!("{root}/2024/05/2024-05-09.csv.gz"),
        ] {
            inner
                .put(&Path::from(key.as_str()), PutPayload::from_static(b"x"))
                .await
                .unwrap();
        }
        let pipeline =
            Pipeline::with_store(test_config(), FlatFileStore::new(Arc::new(inner)));
        let tf = default_timeframes().remove(0);

        let keys = pipeline
            .discover(&tf, date(2024, 5, 6), date(2024, 5, 8))
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec![
                format!("{root}/2024/05/2024-05-07.csv.gz"),
                format!("{root}/2024/05/2024-05-08.csv.gz"),
            ]
        );
    }

    #[tokio::test]
    async fn test_discover_spans_months() {
        let inner = InMemory::new();
        let root = "us_stocks_sip/minute_aggs_v1";
        for key in [
            format!("{root}/2024/04/2024-04-30.csv.gz"),
            format!("{root}/2024/05/2024-05-01.csv.gz"),
        ] {
            inner
                .put(&Path::from(key.as_str()), PutPayload::from_static(b"x"))
                .await
                .unwrap();
        }
        let pipeline =
            Pipeline::with_store(test_config(), FlatFileStore::new(Arc::new(inner)));
        let tf = default_timeframes().remove(0);

        let keys = pipeline
            .discover(&tf, date(2024, 4, 29), date(2024, 5, 2))
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
    }
}
