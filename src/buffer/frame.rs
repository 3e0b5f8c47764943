use std::cell::{Cell, RefCell};

use crate::file::{FileId, PageId, INVALID_PAGE_NO, PAGE_SIZE};

/// Bookkeeping for one buffer frame.
///
/// All fields sit in `Cell`s so pin counts and status bits can move while
/// the pool is borrowed shared; the crate is single-threaded by contract.
pub(crate) struct BufDesc {
    pub file: Cell<Option<FileId>>,
    pub page_no: Cell<PageId>,
    pub pin_cnt: Cell<u32>,
    pub dirty: Cell<bool>,
    pub valid: Cell<bool>,
    pub refbit: Cell<bool>,
}

impl BufDesc {
    pub fn new() -> Self {
        Self {
            file: Cell::new(None),
            page_no: Cell::new(INVALID_PAGE_NO),
            pin_cnt: Cell::new(0),
            dirty: Cell::new(false),
            valid: Cell::new(false),
            refbit: Cell::new(false),
        }
    }

    /// Initialize the descriptor for a newly loaded page: pinned once,
    /// clean, recently referenced.
    pub fn set(&self, file: FileId, page_no: PageId) {
        self.file.set(Some(file));
        self.page_no.set(page_no);
        self.pin_cnt.set(1);
        self.dirty.set(false);
        self.valid.set(true);
        self.refbit.set(true);
    }

    /// Return the descriptor to its unused state.
    pub fn clear(&self) {
        self.file.set(None);
        self.page_no.set(INVALID_PAGE_NO);
        self.pin_cnt.set(0);
        self.dirty.set(false);
        self.valid.set(false);
        self.refbit.set(false);
    }
}

/// A buffer frame: one page image plus its descriptor.
pub(crate) struct Frame {
    pub desc: BufDesc,
    pub data: RefCell<Vec<u8>>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            desc: BufDesc::new(),
            data: RefCell::new(vec![0u8; PAGE_SIZE]),
        }
    }
}
