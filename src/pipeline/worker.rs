//! Pipeline worker: loads one batch of flat files through staging into
//! the target table.
//!
//! Happy path: one pooled connection, one COPY of the whole batch into a
//! per-connection unlogged staging table, one converting upsert into the
//! target. A duplicate-key outcome there means the data is already
//! present and the batch reports as loaded. Any other batch failure
//! drops to the degraded path: files are re-loaded one at a time so a
//! single bad file cannot sink the whole batch.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::BulkLoadPool;
use crate::emit;
use crate::error::{DbError, PipelineError, is_duplicate_key, is_per_file_data_error};
use crate::metrics::events::BatchLoaded;
use crate::pipeline::{DayOutcome, FailedFile, FailureCollector};
use crate::source::{BatchedCsvReader, FlatFileStore};
use crate::timeframe::{Timeframe, parse_day_from_key};

use crate::db::STAGING_PREFIX;

/// Shared work queue of batches; workers pull until it drains.
pub(crate) type BatchQueue = Arc<Mutex<VecDeque<Vec<String>>>>;

/// Worker loop: pull batches until the queue drains or the run is
/// cancelled. Per-file failures are absorbed into outcomes; anything
/// returned as `Err` is fatal to the run.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_worker(
    pool: Arc<BulkLoadPool>,
    store: FlatFileStore,
    timeframe: Timeframe,
    fetch_timeout: Duration,
    queue: BatchQueue,
    results: mpsc::UnboundedSender<DayOutcome>,
    collector: Arc<FailureCollector>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let batch = {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };
        let Some(batch) = batch else {
            return Ok(());
        };

        let outcomes = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(()),

            result = load_batch(&pool, &store, &timeframe, fetch_timeout, &batch) => result?,
        };

        for outcome in outcomes {
            if let DayOutcome::Failed { day, reason } = &outcome {
                collector.push(FailedFile {
                    day: *day,
                    timeframe: timeframe.name,
                    reason: reason.clone(),
                });
            }
            if results.send(outcome).is_err() {
                return Err(PipelineError::ChannelClosed);
            }
        }
    }
}

/// Load one batch, reporting one outcome per day represented in it.
pub(crate) async fn load_batch(
    pool: &BulkLoadPool,
    store: &FlatFileStore,
    timeframe: &Timeframe,
    fetch_timeout: Duration,
    keys: &[String],
) -> Result<Vec<DayOutcome>, PipelineError> {
    load_batch_with(timeframe, keys, |keys| {
        load_keys(pool, store, timeframe, fetch_timeout, keys)
    })
    .await
}

/// Batch outcome mapping, generic over the load itself so the decision
/// logic is testable without a database.
///
/// Whole-batch load first; a duplicate-key result there means the rows
/// are already present and every day reports loaded. Any other batch
/// failure degrades to per-file loads: data errors fail only that
/// file's day, anything else is fatal.
async fn load_batch_with<F, Fut>(
    timeframe: &Timeframe,
    keys: &[String],
    mut load: F,
) -> Result<Vec<DayOutcome>, PipelineError>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<(), PipelineError>>,
{
    let days = batch_days(keys);
    let start = Instant::now();

    match load(keys.to_vec()).await {
        Ok(()) => {
            emit!(BatchLoaded {
                files: keys.len(),
                duration: start.elapsed(),
                target: timeframe.name,
            });
            return Ok(days.into_iter().map(DayOutcome::Loaded).collect());
        }
        Err(error) if is_duplicate_key(&error) => {
            // The rows are already in the target table; not a failure.
            debug!(
                target = timeframe.name,
                files = keys.len(),
                "Batch already present, reporting as loaded"
            );
            return Ok(days.into_iter().map(DayOutcome::Loaded).collect());
        }
        Err(error) => {
            warn!(
                target = timeframe.name,
                error = %error,
                files = keys.len(),
                "Whole-batch load failed, retrying files individually"
            );
        }
    }

    // Degraded path: one file per load. Files are re-fetched from
    // scratch rather than reusing bytes from the failed attempt; the
    // failure path is rare and correctness does not depend on it being
    // cheap.
    let mut outcomes = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(day) = parse_day_from_key(key) else {
            continue;
        };
        match load(vec![key.clone()]).await {
            Ok(()) => outcomes.push(DayOutcome::Loaded(day)),
            Err(error) if is_duplicate_key(&error) => outcomes.push(DayOutcome::Loaded(day)),
            Err(error) if is_per_file_data_error(&error) => {
                warn!(
                    target = timeframe.name,
                    key, error = %error,
                    "File failed to load, recording in ledger"
                );
                outcomes.push(DayOutcome::Failed {
                    day,
                    reason: error.to_string(),
                });
            }
            Err(error) => return Err(error),
        }
    }
    Ok(outcomes)
}

/// Stage and upsert a list of files over one pooled connection.
async fn load_keys(
    pool: &BulkLoadPool,
    store: &FlatFileStore,
    timeframe: &Timeframe,
    fetch_timeout: Duration,
    keys: Vec<String>,
) -> Result<(), PipelineError> {
    let mut conn = pool.acquire().await?;

    // The staging name embeds the session's backend pid: concurrent
    // workers each see their own table without any locking.
    let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
        .fetch_one(&mut *conn)
        .await
        .map_err(DbError::from)?;
    let staging = staging_table_name(timeframe.table, pid);
    sqlx::query(&create_staging_sql(&staging))
        .execute(&mut *conn)
        .await
        .map_err(DbError::from)?;

    let result = copy_and_upsert(&mut conn, &staging, store, timeframe, fetch_timeout, keys).await;

    // Truncate on every exit path so a failed batch never leaves staged
    // rows behind for the next batch on this connection.
    let truncate = sqlx::query(&format!("TRUNCATE {staging}"))
        .execute(&mut *conn)
        .await;

    match (result, truncate) {
        (Err(error), _) => Err(error),
        (Ok(()), Err(source)) => Err(DbError::from(source).into()),
        (Ok(()), Ok(_)) => Ok(()),
    }
}

async fn copy_and_upsert(
    conn: &mut PoolConnection<Postgres>,
    staging: &str,
    store: &FlatFileStore,
    timeframe: &Timeframe,
    fetch_timeout: Duration,
    keys: Vec<String>,
) -> Result<(), PipelineError> {
    let mut reader = BatchedCsvReader::new(
        store.clone(),
        keys,
        timeframe.header_rename,
        fetch_timeout,
        timeframe.name,
    );

    let mut copy = conn
        .copy_in_raw(&copy_sql(staging))
        .await
        .map_err(DbError::from)?;
    loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => {
                copy.send(chunk).await.map_err(DbError::from)?;
            }
            Ok(None) => break,
            Err(error) => {
                // Abort the COPY so the connection returns to a clean state.
                let _ = copy.abort("source stream failed").await;
                return Err(error.into());
            }
        }
    }
    let rows = copy.finish().await.map_err(DbError::from)?;
    debug!(
        target = timeframe.name,
        rows,
        fetch_ms = reader.fetch_time().as_millis() as u64,
        "Staged rows copied"
    );

    sqlx::query(&upsert_sql(timeframe, staging))
        .execute(&mut **conn)
        .await
        .map_err(DbError::from)?;
    Ok(())
}

/// Unique days represented in a batch, in key order.
fn batch_days(keys: &[String]) -> Vec<chrono::NaiveDate> {
    let mut days = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(day) = parse_day_from_key(key) {
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }
    days
}

pub(crate) fn staging_table_name(table: &str, pid: i32) -> String {
    format!("{STAGING_PREFIX}_{table}_{pid}")
}

/// Staging columns mirror the published CSV, header order included, with
/// the timestamp still in integer epoch nanoseconds.
fn create_staging_sql(staging: &str) -> String {
    format!(
        "CREATE UNLOGGED TABLE IF NOT EXISTS {staging} (\
         ticker text, \
         volume bigint, \
         open double precision, \
         close double precision, \
         high double precision, \
         low double precision, \
         ts_ns bigint, \
         transactions bigint)"
    )
}

/// HEADER MATCH verifies the (rewritten) CSV header against the staging
/// columns, so a provider-side column reorder fails loudly instead of
/// loading garbage.
fn copy_sql(staging: &str) -> String {
    format!("COPY {staging} FROM STDIN WITH (FORMAT csv, HEADER MATCH)")
}

/// Converting upsert from staging into the target table.
///
/// Epoch nanoseconds are converted to a timestamptz via integer
/// microseconds (exact; the target granularity is microseconds). Rows
/// with an empty ticker cannot satisfy the unique key and are skipped.
/// Re-ingesting a file yields identical rows: latest values win.
fn upsert_sql(timeframe: &Timeframe, staging: &str) -> String {
    format!(
        "INSERT INTO {table} (ticker, ts, open, high, low, close, volume, transactions) \
         SELECT ticker, \
                timestamptz 'epoch' + (ts_ns / 1000) * interval '1 microsecond', \
                open, high, low, close, volume, transactions \
         FROM {staging} \
         WHERE ticker <> '' \
         ON CONFLICT {conflict} DO UPDATE SET \
         open = EXCLUDED.open, \
         high = EXCLUDED.high, \
         low = EXCLUDED.low, \
         close = EXCLUDED.close, \
         volume = EXCLUDED.volume, \
         transactions = EXCLUDED.transactions",
        table = timeframe.table,
        staging = staging,
        conflict = timeframe.conflict_target,
    )
}
