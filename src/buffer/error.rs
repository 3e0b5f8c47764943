use thiserror::Error;

use crate::file::{FileError, PageId};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Buffer exceeded: all frames are pinned")]
    BufferExceeded,

    #[error("Page {page_no} in frame {frame_no} is not pinned")]
    PageNotPinned { page_no: PageId, frame_no: usize },

    #[error("Page {page_no} in frame {frame_no} is pinned")]
    PagePinned { page_no: PageId, frame_no: usize },

    #[error("Page {page_no} not found in the buffer pool")]
    HashNotFound { page_no: PageId },

    #[error("Bad buffer: frame {frame_no} descriptor is inconsistent")]
    BadBuffer { frame_no: usize },

    #[error("File error: {0}")]
    File(#[from] FileError),
}

pub type BufferResult<T> = Result<T, BufferError>;
