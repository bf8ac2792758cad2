//! Persisted run state: the per-timeframe watermark and the failed-file
//! ledger.
//!
//! `last_loaded_at` holds one row per timeframe: the latest day through
//! which ingestion is proven complete. `failed_files` is an append-only
//! ledger of per-day failures; rows are never retried automatically and
//! exist for operator-initiated backfills.

use chrono::NaiveDate;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::DbError;
use crate::pipeline::FailedFile;

/// Read the persisted watermark for a timeframe, if any.
pub async fn read_watermark(pool: &PgPool, timeframe: &str) -> Result<Option<NaiveDate>, DbError> {
    let day = sqlx::query_scalar::<_, NaiveDate>(
        "SELECT day FROM last_loaded_at WHERE timeframe = $1",
    )
    .bind(timeframe)
    .fetch_optional(pool)
    .await?;
    Ok(day)
}

/// Upsert the watermark for a timeframe. Monotonicity is enforced in SQL
/// as well: a stale writer can never move the watermark backwards.
pub async fn persist_watermark(
    pool: &PgPool,
    timeframe: &str,
    day: NaiveDate,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO last_loaded_at (timeframe, day) VALUES ($1, $2) \
         ON CONFLICT (timeframe) DO UPDATE SET day = EXCLUDED.day \
         WHERE last_loaded_at.day < EXCLUDED.day",
    )
    .bind(timeframe)
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

/// Append failures to the ledger. Idempotent: a (day, timeframe) pair is
/// recorded once; re-runs that fail again do not duplicate it.
pub async fn record_failed_files(pool: &PgPool, failures: &[FailedFile]) -> Result<(), DbError> {
    for failure in failures {
        sqlx::query(
            "INSERT INTO failed_files (day, timeframe, reason) VALUES ($1, $2, $3) \
             ON CONFLICT (day, timeframe) DO NOTHING",
        )
        .bind(failure.day)
        .bind(failure.timeframe)
        .bind(&failure.reason)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Read back the ledger for a timeframe, oldest first.
pub async fn failed_days(
    pool: &PgPool,
    timeframe: &str,
) -> Result<Vec<(NaiveDate, String)>, DbError> {
    let rows = sqlx::query(
        "SELECT day, reason FROM failed_files WHERE timeframe = $1 ORDER BY day",
    )
    .bind(timeframe)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<NaiveDate, _>("day"), row.get::<String, _>("reason")))
        .collect())
}
