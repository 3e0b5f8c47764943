use thiserror::Error;

use crate::buffer::BufferError;
use crate::file::{FileError, PageId};
use crate::relation::RelationError;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Relation error: {0}")]
    Relation(#[from] RelationError),

    #[error("Bad index info: {0}")]
    BadIndexInfo(String),

    #[error("Corrupted node data at page {0}")]
    CorruptedNode(PageId),

    #[error("Scan operators must be GT/GTE for the lower bound and LT/LTE for the upper bound")]
    BadOpcodes,

    #[error("Scan range is invalid: lower bound exceeds upper bound")]
    BadScanrange,

    #[error("No key in the scan range")]
    NoSuchKeyFound,

    #[error("No scan has been initialized")]
    ScanNotInitialized,

    #[error("Scan has passed the last qualifying entry")]
    IndexScanCompleted,
}
