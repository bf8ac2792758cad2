//! Bulk ingestion of daily OHLCV flat files into TimescaleDB.
//!
//! Icefall discovers per-day gzip CSV files in an S3-compatible bucket,
//! streams batches of them through `COPY` into unlogged staging tables,
//! and upserts into time-partitioned candle tables. Progress is tracked
//! as a per-timeframe watermark: the latest day through which ingestion
//! is proven complete. Runs are idempotent and resumable; a crashed run
//! re-ingests at most the days past its last persisted watermark.
//!
//! ```no_run
//! use icefall::{Config, Pipeline};
//!
//! # async fn run() -> Result<(), icefall::PipelineError> {
//! let config = Config::from_env()?;
//! Pipeline::new(config)?.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod source;
pub mod timeframe;
pub mod tracker;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use tracker::DayTracker;
