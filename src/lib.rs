//! Paged storage core: a CLOCK buffer pool with pin counting and a
//! disk-backed B+ tree index over a single integer attribute.

pub mod buffer;
pub mod file;
pub mod index;
pub mod relation;

pub use buffer::{BufMgr, BufferError, PagePin, DEFAULT_POOL_SIZE};
pub use file::{BlobFile, FileError, FileId, PageId, INVALID_PAGE_NO, PAGE_SIZE};
pub use index::{BTreeIndex, Datatype, IndexError, Key, Operator};
pub use relation::{FileScan, RecordId, RelationError, SlotId, TableFile};
