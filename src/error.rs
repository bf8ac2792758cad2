//! Error types for the icefall bulk loader.
//!
//! Errors fall into four operational classes (see the classification
//! helpers at the bottom of this module):
//!
//! - **Transient infrastructure**: retried with bounded backoff at pool
//!   construction time.
//! - **Per-file data errors**: absorbed into the failed-file ledger; the
//!   run continues.
//! - **Duplicate-key outcomes**: not errors at all, the data is already
//!   present.
//! - **Fatal**: everything else; aborts the timeframe run.

use snafu::prelude::*;

/// Errors that can occur during configuration loading.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// One or more environment variables are missing or invalid.
    #[snafu(display("multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

/// Errors that can occur during object store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Failed to build the S3 client from configuration.
    #[snafu(display("Failed to build object store client: {source}"))]
    Build { source: object_store::Error },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// Remote fetch exceeded its timeout.
    #[snafu(display("Fetch of '{key}' timed out after {timeout_secs}s"))]
    FetchTimeout { key: String, timeout_secs: u64 },
}

/// Errors that can occur while reading the concatenated CSV stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReaderError {
    /// Failed to fetch a remote file.
    #[snafu(display("Failed to fetch '{key}': {source}"))]
    Fetch { key: String, source: StorageError },

    /// Compressed stream is corrupt or truncated.
    #[snafu(display("Corrupt compressed stream in '{key}': {source}"))]
    CorruptStream { key: String, source: std::io::Error },

    /// File contains no header line.
    #[snafu(display("File '{key}' is missing a header line"))]
    MissingHeader { key: String },
}

/// Errors that can occur during database operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DbError {
    /// Database operation failed.
    #[snafu(display("Database operation failed: {source}"))]
    Sqlx { source: sqlx::Error },

    /// Pool construction exhausted its retry budget.
    #[snafu(display("Pool construction failed after {attempts} attempts: {source}"))]
    ConnectRetriesExhausted { attempts: u32, source: sqlx::Error },
}

impl From<sqlx::Error> for DbError {
    fn from(source: sqlx::Error) -> Self {
        DbError::Sqlx { source }
    }
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Reader error.
    #[snafu(display("Reader error: {source}"))]
    Reader { source: ReaderError },

    /// Database error.
    #[snafu(display("Database error: {source}"))]
    Db { source: DbError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Result channel closed unexpectedly.
    #[snafu(display("Result channel closed unexpectedly"))]
    ChannelClosed,
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<ReaderError> for PipelineError {
    fn from(source: ReaderError) -> Self {
        PipelineError::Reader { source }
    }
}

impl From<DbError> for PipelineError {
    fn from(source: DbError) -> Self {
        PipelineError::Db { source }
    }
}

// ============ Classification ============

/// SQLSTATE classes treated as per-file data errors.
///
/// Class 22 covers malformed input ("invalid input syntax", bad numeric
/// literals, out-of-range timestamps); 57014 is a cancelled statement.
fn is_data_error_code(code: &str) -> bool {
    code.starts_with("22") || code == "57014"
}

/// SQLSTATE codes treated as "the rows are already present".
///
/// 23505 is a unique violation. 21000 arises when one upsert statement
/// touches the same key twice, which is the same already-present
/// condition, seen when a file is re-ingested within a batch.
fn is_duplicate_key_code(code: &str) -> bool {
    code == "23505" || code == "21000"
}

fn db_code(error: &PipelineError) -> Option<String> {
    match error {
        PipelineError::Db {
            source: DbError::Sqlx {
                source: sqlx::Error::Database(db),
            },
        } => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// True if this error means the batch's rows are already in the target
/// table. Not a failure: the batch is reported as loaded.
pub fn is_duplicate_key(error: &PipelineError) -> bool {
    db_code(error).is_some_and(|c| is_duplicate_key_code(&c))
}

/// True if this error should be absorbed as a single-file failure on the
/// degraded path (recorded in the ledger, run continues).
pub fn is_per_file_data_error(error: &PipelineError) -> bool {
    if matches!(
        error,
        PipelineError::Reader {
            source: ReaderError::CorruptStream { .. } | ReaderError::MissingHeader { .. }
        }
    ) {
        return true;
    }
    db_code(error).is_some_and(|c| is_data_error_code(&c))
}

/// True if a connection-establishment error is worth retrying.
pub fn is_transient_connect_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::TimedOut
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug)]
    struct FakeDbError {
        code: &'static str,
    }

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake database error ({})", self.code)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            "fake database error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    /// A [`PipelineError`] carrying the given SQLSTATE, for exercising
    /// the classification helpers without a live database.
    pub(crate) fn db_error(code: &'static str) -> PipelineError {
        PipelineError::Db {
            source: DbError::Sqlx {
                source: sqlx::Error::Database(Box::new(FakeDbError { code })),
            },
        }
    }
}
