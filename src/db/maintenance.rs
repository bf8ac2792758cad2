//! DB-side maintenance: index churn, statistics refresh, chunk
//! compression, and leftover staging cleanup.
//!
//! All helpers are thin wrappers over DDL/utility statements; identifiers
//! come from the fixed [`Timeframe`](crate::timeframe::Timeframe) set,
//! never from external input.

use chrono::NaiveDate;
use sqlx::Row;
use sqlx::postgres::PgPool;
use tracing::{debug, info};

use crate::error::DbError;
use crate::timeframe::Timeframe;

/// Prefix of every ephemeral staging table created by workers.
pub(crate) const STAGING_PREFIX: &str = "icefall_staging";

/// Drop non-essential secondary indexes before a cold-start bulk load.
///
/// Warm starts skip this: the indexes already reflect prior data, and
/// rebuilding them would cost more than it saves.
pub async fn drop_secondary_indexes(pool: &PgPool, timeframe: &Timeframe) -> Result<(), DbError> {
    for index in timeframe.secondary_indexes {
        info!(table = timeframe.table, index = index.name, "Dropping secondary index");
        sqlx::query(&format!("DROP INDEX IF EXISTS {}", index.name))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Recreate secondary indexes. Idempotent; always run after a timeframe's
/// batches finish, regardless of whether the indexes were dropped.
pub async fn create_secondary_indexes(pool: &PgPool, timeframe: &Timeframe) -> Result<(), DbError> {
    for index in timeframe.secondary_indexes {
        info!(table = timeframe.table, index = index.name, "Creating secondary index");
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} {}",
            index.name, timeframe.table, index.columns
        ))
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Refresh planner statistics for the target table.
pub async fn analyze_table(pool: &PgPool, table: &str) -> Result<(), DbError> {
    debug!(table, "Refreshing table statistics");
    sqlx::query(&format!("ANALYZE {table}")).execute(pool).await?;
    Ok(())
}

/// Compress hypertable chunks older than `boundary`.
///
/// The caller bounds this by min(now - recency guard, watermark) so
/// still-mutable recent data is never compacted.
pub async fn compress_chunks_older_than(
    pool: &PgPool,
    table: &str,
    boundary: NaiveDate,
) -> Result<u64, DbError> {
    let result = sqlx::query(&format!(
        "SELECT compress_chunk(c, true) \
         FROM show_chunks('{table}', older_than => $1::date) AS c"
    ))
    .bind(boundary)
    .execute(pool)
    .await?;
    debug!(table, %boundary, chunks = result.rows_affected(), "Compression pass complete");
    Ok(result.rows_affected())
}

/// Drop any staging tables left behind by this timeframe's workers.
///
/// Staging tables embed the creating backend's pid, so a crashed run can
/// orphan them; this sweep runs at the end of every timeframe.
pub async fn drop_leftover_staging(pool: &PgPool, table: &str) -> Result<(), DbError> {
    let pattern = format!("{STAGING_PREFIX}_{table}_%");
    let rows = sqlx::query("SELECT tablename FROM pg_tables WHERE tablename LIKE $1")
        .bind(&pattern)
        .fetch_all(pool)
        .await?;
    for row in rows {
        let name: String = row.get("tablename");
        debug!(staging = %name, "Dropping leftover staging table");
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}
