//! Environment-sourced configuration.
//!
//! The pipeline is invoked as a unit of work by a surrounding scheduler,
//! so all configuration comes from the environment. Errors are
//! accumulated so the operator sees every missing variable at once.

use std::time::Duration;

use crate::error::ConfigError;
use crate::timeframe::{Timeframe, default_timeframes};

/// Object store connection settings for the flat-file bucket.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Custom S3-compatible endpoint, if any.
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Database connection settings for the bulk-load pool.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    /// Per-session working memory budget for bulk writes.
    pub work_mem: String,
    /// Per-statement timeout; a cancelled statement is classified as a
    /// per-file data error, not a fatal one.
    pub statement_timeout: Duration,
    pub acquire_timeout: Duration,
}

/// Tunables for a single ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Worker pool size; the bulk-load pool is sized to match.
    pub workers: usize,
    /// Years of history to backfill on a cold start.
    pub backfill_years: u32,
    /// Bound on each remote object fetch.
    pub fetch_timeout: Duration,
    /// Aggregator flush interval (failed-file ledger + watermark persist).
    pub flush_interval: Duration,
    /// Recency guard: chunks younger than this are never compacted, even
    /// if the watermark has passed them.
    pub compress_guard_days: u32,
}

/// Root configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct Config {
    pub object_store: ObjectStoreConfig,
    pub db: DbConfig,
    pub ingest: IngestConfig,
    pub timeframes: Vec<Timeframe>,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Missing and invalid variables are accumulated into a single
    /// [`ConfigError`] rather than failing on the first one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let access_key_id = require(&mut errors, "ICEFALL_S3_ACCESS_KEY_ID");
        let secret_access_key = require(&mut errors, "ICEFALL_S3_SECRET_ACCESS_KEY");
        let database_url = require(&mut errors, "DATABASE_URL");

        let workers = parse_or(&mut errors, "ICEFALL_WORKERS", 4usize);
        let backfill_years = parse_or(&mut errors, "ICEFALL_BACKFILL_YEARS", 5u32);
        let fetch_timeout_secs = parse_or(&mut errors, "ICEFALL_FETCH_TIMEOUT_SECS", 120u64);
        let flush_interval_secs = parse_or(&mut errors, "ICEFALL_FLUSH_INTERVAL_SECS", 30u64);
        let compress_guard_days = parse_or(&mut errors, "ICEFALL_COMPRESS_GUARD_DAYS", 7u32);
        let statement_timeout_secs =
            parse_or(&mut errors, "ICEFALL_STATEMENT_TIMEOUT_SECS", 600u64);

        if workers == Some(0) {
            errors.push("environment variable 'ICEFALL_WORKERS' must be at least 1".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::MultipleErrors { errors });
        }

        Ok(Self {
            object_store: ObjectStoreConfig {
                endpoint: optional("ICEFALL_S3_ENDPOINT"),
                bucket: optional("ICEFALL_S3_BUCKET").unwrap_or_else(|| "flatfiles".to_string()),
                region: optional("ICEFALL_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id: access_key_id.unwrap(),
                secret_access_key: secret_access_key.unwrap(),
            },
            db: DbConfig {
                url: database_url.unwrap(),
                work_mem: optional("ICEFALL_WORK_MEM").unwrap_or_else(|| "256MB".to_string()),
                statement_timeout: Duration::from_secs(statement_timeout_secs.unwrap()),
                acquire_timeout: Duration::from_secs(30),
            },
            ingest: IngestConfig {
                workers: workers.unwrap(),
                backfill_years: backfill_years.unwrap(),
                fetch_timeout: Duration::from_secs(fetch_timeout_secs.unwrap()),
                flush_interval: Duration::from_secs(flush_interval_secs.unwrap()),
                compress_guard_days: compress_guard_days.unwrap(),
            },
            timeframes: default_timeframes(),
        })
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn require(errors: &mut Vec<String>, name: &str) -> Option<String> {
    match optional(name) {
        Some(value) => Some(value),
        None => {
            errors.push(format!("environment variable '{name}' is not set"));
            None
        }
    }
}

fn parse_or<T: std::str::FromStr>(errors: &mut Vec<String>, name: &str, default: T) -> Option<T> {
    match optional(name) {
        None => Some(default),
        Some(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                errors.push(format!(
                    "environment variable '{name}' has invalid value '{raw}'"
                ));
                None
            }
        },
    }
}
