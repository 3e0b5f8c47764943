mod buf_mgr;
mod error;
mod frame;

pub use buf_mgr::{BufMgr, PagePin};
pub use error::{BufferError, BufferResult};

/// Default number of frames in the buffer pool
pub const DEFAULT_POOL_SIZE: usize = 1024;
