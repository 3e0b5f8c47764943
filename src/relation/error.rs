use thiserror::Error;

use crate::buffer::BufferError;
use crate::file::{FileError, PageId};

use super::SlotId;

/// Result type for relation operations
pub type RelationResult<T> = Result<T, RelationError>;

#[derive(Debug, Error)]
pub enum RelationError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("End of file reached")]
    EndOfFile,

    #[error("Record length {actual} does not match table record length {expected}")]
    WrongRecordLength { expected: usize, actual: usize },

    #[error("Record length {len} exceeds page capacity {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("Invalid table header: {0}")]
    InvalidHeader(String),

    #[error("Invalid record id: page {page_no} slot {slot_no}")]
    InvalidRid { page_no: PageId, slot_no: SlotId },
}
