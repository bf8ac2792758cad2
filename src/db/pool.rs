//! Bulk-load connection pool.
//!
//! A dedicated pool, distinct from any application pool, sized exactly to
//! the worker count so each worker owns one connection for the duration
//! of a batch. Sessions are tuned at establishment time for append-mostly
//! bulk writes; construction retries transient failures with bounded
//! exponential backoff.

use std::time::Duration;

use sqlx::Executor;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use tracing::{info, warn};

use crate::config::DbConfig;
use crate::error::{DbError, is_transient_connect_error};

/// Attempt cap for transient construction failures.
const MAX_CONNECT_ATTEMPTS: u32 = 5;
/// First retry delay; doubles per attempt up to [`MAX_CONNECT_DELAY`].
const INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_CONNECT_DELAY: Duration = Duration::from_secs(8);

/// Connection pool tuned for high-throughput bulk writes.
pub struct BulkLoadPool {
    pool: PgPool,
}

impl BulkLoadPool {
    /// Connect with one pooled connection per worker, plus one reserved
    /// for state and maintenance statements.
    ///
    /// Retries with bounded exponential backoff strictly for errors
    /// classified as transient (refused/reset/timeout); anything else
    /// fails immediately.
    pub async fn connect(config: &DbConfig, workers: usize) -> Result<Self, DbError> {
        let mut attempt: u32 = 1;
        let mut delay = INITIAL_CONNECT_DELAY;
        loop {
            match Self::try_connect(config, workers).await {
                Ok(pool) => {
                    info!(workers, "Bulk load pool ready");
                    return Ok(Self { pool });
                }
                Err(source) if is_transient_connect_error(&source) => {
                    if attempt >= MAX_CONNECT_ATTEMPTS {
                        return Err(DbError::ConnectRetriesExhausted {
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "Transient pool construction failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_CONNECT_DELAY);
                    attempt += 1;
                }
                Err(source) => return Err(DbError::Sqlx { source }),
            }
        }
    }

    async fn try_connect(config: &DbConfig, workers: usize) -> Result<PgPool, sqlx::Error> {
        let tuning = session_tuning(config);
        PgPoolOptions::new()
            .max_connections(max_connections(workers))
            .acquire_timeout(config.acquire_timeout)
            .after_connect(move |conn, _meta| {
                let tuning = tuning.clone();
                Box::pin(async move {
                    conn.execute(tuning.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await
    }

    /// Acquire one connection for a unit of work.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, DbError> {
        Ok(self.pool.acquire().await?)
    }

    /// The underlying pool, for state and maintenance statements.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close all connections; the caller owns the pool lifetime and calls
    /// this once the run completes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pool size: one connection per worker plus one spare.
///
/// The spare keeps watermark flushes, ledger writes, and compression
/// triggers from competing with workers. With exactly `workers`
/// connections, a flush arriving while every worker is inside a long
/// COPY would hit an exhausted pool and time out, failing a healthy run.
fn max_connections(workers: usize) -> u32 {
    workers as u32 + 1
}

/// Session settings applied to every pooled connection.
///
/// `synchronous_commit = off` trades durability of the last instants of
/// work for throughput. That is safe here because progress is only
/// claimed by the watermark after its own committed upsert. The timescaledb GUC
/// disables the per-statement limit on decompressed tuples so upserts
/// that touch compressed chunks are not aborted mid-load.
fn session_tuning(config: &DbConfig) -> String {
    format!(
        "SET work_mem = '{}'; \
         SET synchronous_commit = off; \
         SET statement_timeout = {}; \
         SET timescaledb.max_tuples_decompressed_per_dml_transaction = 0;",
        config.work_mem,
        config.statement_timeout.as_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DbConfig {
        DbConfig {
            url: "postgres://localhost/bars".to_string(),
            work_mem: "256MB".to_string(),
            statement_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_session_tuning_statements() {
        let sql = session_tuning(&test_config());
        assert!(sql.contains("SET work_mem = '256MB'"));
        assert!(sql.contains("SET synchronous_commit = off"));
        assert!(sql.contains("SET statement_timeout = 600000"));
        assert!(sql.contains("max_tuples_decompressed_per_dml_transaction = 0"));
    }

    #[test]
    fn test_pool_holds_a_spare_connection() {
        // Aggregator flushes must never wait behind a fully busy worker
        // set.
        assert_eq!(max_connections(4), 5);
        assert_eq!(max_connections(1), 2);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let mut delay = INITIAL_CONNECT_DELAY;
        for _ in 0..20 {
            delay = (delay * 2).min(MAX_CONNECT_DELAY);
        }
        assert_eq!(delay, MAX_CONNECT_DELAY);
    }
}
