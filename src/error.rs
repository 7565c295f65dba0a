use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Network failure while fetching one page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fetch task ended without a result")]
    Lost,
}

/// Why a detail page produced no record. Always recoverable at key granularity.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("form '{0}' not found")]
    FormNotFound(String),
    #[error("malformed contract period: {0:?}")]
    MalformedContractPeriod(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {path:?} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot create table without columns")]
    EmptySchema,
}

impl StoreError {
    /// Classify a rusqlite error raised while opening or first touching `path`.
    pub fn on_open(path: &std::path::Path, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => StoreError::Corrupt {
                path: path.to_path_buf(),
                source: err,
            },
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Run-level failures. Each aborts the run and is reported in the summary.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("another run holds the lock {0:?}")]
    Busy(PathBuf),
    #[error("run lock: {0}")]
    Lock(#[source] std::io::Error),
    #[error("failed to fetch listing page: {0}")]
    Listing(#[source] FetchError),
    #[error("failed to read existing keys: {0}")]
    StoreRead(#[source] StoreError),
    #[error("failed to write new records: {0}")]
    StoreWrite(#[source] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_errors_carry_reason() {
        let e = HarvestError::Listing(FetchError::Status(503));
        assert_eq!(e.to_string(), "failed to fetch listing page: HTTP status 503");

        let e = ExtractionError::FormNotFound("jobForm".into());
        assert_eq!(e.to_string(), "form 'jobForm' not found");
    }

    #[test]
    fn open_error_classification() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        );
        let path = std::path::Path::new("x.sqlite");
        assert!(matches!(StoreError::on_open(path, err), StoreError::Corrupt { .. }));

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::on_open(path, err), StoreError::Sqlite(_)));
    }
}
