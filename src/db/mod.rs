//! Relational store access: bulk-load pool, persisted run state, and
//! maintenance helpers.

mod maintenance;
mod pool;
mod state;

pub use maintenance::{
    analyze_table, compress_chunks_older_than, create_secondary_indexes, drop_leftover_staging,
    drop_secondary_indexes,
};
pub(crate) use maintenance::STAGING_PREFIX;
pub use pool::BulkLoadPool;
pub use state::{failed_days, persist_watermark, read_watermark, record_failed_files};
