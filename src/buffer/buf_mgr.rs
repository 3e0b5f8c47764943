use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;

use log::{debug, trace};

use super::error::{BufferError, BufferResult};
use super::frame::Frame;
use crate::file::{FileId, FileResult, FileTable, PageId};

/// Buffer pool with CLOCK replacement and pin counting.
///
/// The pool keeps at most one in-memory copy of any `(file, page)` pair and
/// never evicts a pinned frame. All operations take `&self`: descriptors
/// live in `Cell`s and page images in `RefCell`s, so several pages can be
/// pinned at once from one call chain. The pool owns the open-file table so
/// that evicting a dirty frame can always reach the file it belongs to.
pub struct BufMgr {
    frames: Vec<Frame>,
    page_table: RefCell<HashMap<(FileId, PageId), usize>>,
    clock_hand: Cell<usize>,
    files: RefCell<FileTable>,
}

impl BufMgr {
    /// Create a pool with `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0, "buffer pool needs at least one frame");

        let mut frames = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            frames.push(Frame::new());
        }

        Self {
            frames,
            page_table: RefCell::new(HashMap::new()),
            // Start one position before frame 0 so the first advance lands
            // on the first frame.
            clock_hand: Cell::new(num_frames - 1),
            files: RefCell::new(FileTable::new()),
        }
    }

    // ---- file registry -----------------------------------------------------

    /// Create a new paged file and register it with the pool.
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> FileResult<FileId> {
        self.files.borrow_mut().create_file(path)
    }

    /// Open an existing paged file, reusing the handle if already open.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> FileResult<FileId> {
        self.files.borrow_mut().open_file(path)
    }

    /// Close a file handle. The caller is responsible for flushing first.
    pub fn close_file(&self, file: FileId) -> FileResult<()> {
        self.files.borrow_mut().close_file(file)
    }

    /// Number of pages allocated in a registered file.
    pub fn file_page_count(&self, file: FileId) -> FileResult<u32> {
        Ok(self.files.borrow_mut().get(file)?.page_count())
    }

    /// Page number of the first page of a registered file.
    pub fn first_page_no(&self, file: FileId) -> FileResult<PageId> {
        Ok(self.files.borrow_mut().get(file)?.first_page_no())
    }

    // ---- pool operations ---------------------------------------------------

    /// Pin a page, loading it from disk on a miss.
    ///
    /// The returned guard unpins on drop; `write`/`mark_dirty` on the guard
    /// latch the dirty bit for write-back.
    pub fn read_page(&self, file: FileId, page_no: PageId) -> BufferResult<PagePin<'_>> {
        let cached = self.page_table.borrow().get(&(file, page_no)).copied();

        let frame_no = match cached {
            Some(frame_no) => {
                let desc = &self.frames[frame_no].desc;
                desc.refbit.set(true);
                desc.pin_cnt.set(desc.pin_cnt.get() + 1);
                frame_no
            }
            None => {
                let frame_no = self.alloc_buf()?;
                {
                    let mut files = self.files.borrow_mut();
                    let blob = files.get(file)?;
                    let mut data = self.frames[frame_no].data.borrow_mut();
                    blob.read_page(page_no, &mut data)?;
                }
                self.page_table
                    .borrow_mut()
                    .insert((file, page_no), frame_no);
                self.frames[frame_no].desc.set(file, page_no);
                frame_no
            }
        };

        Ok(PagePin::new(self, file, page_no, frame_no))
    }

    /// Allocate a fresh page in `file` and pin it.
    pub fn alloc_page(&self, file: FileId) -> BufferResult<(PageId, PagePin<'_>)> {
        let page_no = self.files.borrow_mut().get(file)?.allocate_page()?;

        let frame_no = self.alloc_buf()?;
        self.frames[frame_no].data.borrow_mut().fill(0);
        self.page_table
            .borrow_mut()
            .insert((file, page_no), frame_no);
        self.frames[frame_no].desc.set(file, page_no);

        Ok((page_no, PagePin::new(self, file, page_no, frame_no)))
    }

    /// Drop one pin from a page, optionally latching the dirty bit.
    pub fn unpin_page(&self, file: FileId, page_no: PageId, dirty: bool) -> BufferResult<()> {
        let frame_no = self.lookup(file, page_no)?;
        let desc = &self.frames[frame_no].desc;

        if desc.pin_cnt.get() == 0 {
            return Err(BufferError::PageNotPinned { page_no, frame_no });
        }
        desc.pin_cnt.set(desc.pin_cnt.get() - 1);

        if dirty {
            desc.dirty.set(true);
        }
        Ok(())
    }

    /// Write back and drop every cached page of `file`.
    ///
    /// Fails with `PagePinned` if any page of the file is still pinned and
    /// with `BadBuffer` if a descriptor claims the file while invalid.
    pub fn flush_file(&self, file: FileId) -> BufferResult<()> {
        for (frame_no, frame) in self.frames.iter().enumerate() {
            let desc = &frame.desc;
            if desc.file.get() != Some(file) {
                continue;
            }
            if desc.pin_cnt.get() > 0 {
                return Err(BufferError::PagePinned {
                    page_no: desc.page_no.get(),
                    frame_no,
                });
            }
            if !desc.valid.get() {
                return Err(BufferError::BadBuffer { frame_no });
            }
            if desc.dirty.get() {
                self.write_back(frame_no)?;
            }
            self.page_table
                .borrow_mut()
                .remove(&(file, desc.page_no.get()));
            desc.clear();
        }

        self.files.borrow_mut().get(file)?.sync()?;
        debug!("flushed file {}", file.as_u32());
        Ok(())
    }

    /// Drop a page from the pool (if cached) and delete it from the file.
    pub fn dispose_page(&self, file: FileId, page_no: PageId) -> BufferResult<()> {
        let cached = self.page_table.borrow().get(&(file, page_no)).copied();
        if let Some(frame_no) = cached {
            let desc = &self.frames[frame_no].desc;
            if desc.pin_cnt.get() > 0 {
                return Err(BufferError::PagePinned { page_no, frame_no });
            }
            self.page_table.borrow_mut().remove(&(file, page_no));
            desc.clear();
        }

        self.files.borrow_mut().get(file)?.delete_page(page_no)?;
        Ok(())
    }

    /// Dump the state of every frame to stderr. Diagnostic only.
    pub fn print_self(&self) {
        let mut valid_frames = 0;
        for (frame_no, frame) in self.frames.iter().enumerate() {
            let desc = &frame.desc;
            eprintln!(
                "frame {}: file={:?} page={} pin={} dirty={} valid={} refbit={}",
                frame_no,
                desc.file.get().map(|f| f.as_u32()),
                desc.page_no.get(),
                desc.pin_cnt.get(),
                desc.dirty.get(),
                desc.valid.get(),
                desc.refbit.get(),
            );
            if desc.valid.get() {
                valid_frames += 1;
            }
        }
        eprintln!("total valid frames: {}", valid_frames);
    }

    // ---- introspection -----------------------------------------------------

    /// Number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Pin count of a page, or `None` if it is not cached.
    pub fn pin_count(&self, file: FileId, page_no: PageId) -> Option<u32> {
        let frame_no = *self.page_table.borrow().get(&(file, page_no))?;
        Some(self.frames[frame_no].desc.pin_cnt.get())
    }

    pub fn is_page_cached(&self, file: FileId, page_no: PageId) -> bool {
        self.page_table.borrow().contains_key(&(file, page_no))
    }

    /// Number of frames with at least one pin.
    pub fn pinned_frame_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.desc.pin_cnt.get() > 0)
            .count()
    }

    // ---- internals ---------------------------------------------------------

    fn lookup(&self, file: FileId, page_no: PageId) -> BufferResult<usize> {
        self.page_table
            .borrow()
            .get(&(file, page_no))
            .copied()
            .ok_or(BufferError::HashNotFound { page_no })
    }

    fn advance_clock(&self) -> usize {
        let next = (self.clock_hand.get() + 1) % self.frames.len();
        self.clock_hand.set(next);
        next
    }

    /// Select a victim frame with the CLOCK sweep.
    ///
    /// The pinned counter resets whenever a reference bit is cleared, so a
    /// frame that becomes evictable mid-sweep is still found; only a sweep
    /// that sees nothing but pinned frames reports `BufferExceeded`. The
    /// step bound caps the sweep at two revolutions.
    fn alloc_buf(&self) -> BufferResult<usize> {
        let num_frames = self.frames.len();
        let mut pinned = 0;

        for _ in 0..(2 * num_frames + 1) {
            let hand = self.advance_clock();
            let desc = &self.frames[hand].desc;

            if !desc.valid.get() {
                desc.clear();
                return Ok(hand);
            }

            if desc.refbit.get() {
                desc.refbit.set(false);
                pinned = 0;
                continue;
            }

            if desc.pin_cnt.get() > 0 {
                pinned += 1;
                if pinned >= num_frames {
                    return Err(BufferError::BufferExceeded);
                }
                continue;
            }

            if desc.dirty.get() {
                self.write_back(hand)?;
            }
            if let Some(owner) = desc.file.get() {
                self.page_table
                    .borrow_mut()
                    .remove(&(owner, desc.page_no.get()));
            }
            trace!("evicting page {} from frame {}", desc.page_no.get(), hand);
            desc.clear();
            return Ok(hand);
        }

        Err(BufferError::BufferExceeded)
    }

    fn write_back(&self, frame_no: usize) -> BufferResult<()> {
        let frame = &self.frames[frame_no];
        let desc = &frame.desc;
        let file = desc
            .file
            .get()
            .ok_or(BufferError::BadBuffer { frame_no })?;

        let mut files = self.files.borrow_mut();
        let blob = files.get(file)?;
        let data = frame.data.borrow();
        blob.write_page(desc.page_no.get(), &data)?;
        desc.dirty.set(false);

        trace!(
            "wrote back page {} of file {} from frame {}",
            desc.page_no.get(),
            file.as_u32(),
            frame_no
        );
        Ok(())
    }
}

impl Drop for BufMgr {
    fn drop(&mut self) {
        // Best-effort write-back of every dirty valid frame, pinned or not.
        for frame_no in 0..self.frames.len() {
            let desc = &self.frames[frame_no].desc;
            if desc.valid.get() && desc.dirty.get() {
                let _ = self.write_back(frame_no);
            }
        }
    }
}

/// Scoped pin on one buffered page.
///
/// Dropping the guard releases the pin on every exit path and reports the
/// latched dirty bit to the pool.
pub struct PagePin<'a> {
    pool: &'a BufMgr,
    file: FileId,
    page_no: PageId,
    frame_no: usize,
    dirty: Cell<bool>,
}

impl<'a> PagePin<'a> {
    fn new(pool: &'a BufMgr, file: FileId, page_no: PageId, frame_no: usize) -> Self {
        Self {
            pool,
            file,
            page_no,
            frame_no,
            dirty: Cell::new(false),
        }
    }

    pub fn page_no(&self) -> PageId {
        self.page_no
    }

    /// Read the page image.
    pub fn read<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        let data = self.pool.frames[self.frame_no].data.borrow();
        f(&data)
    }

    /// Mutate the page image; marks the page dirty.
    pub fn write<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        self.dirty.set(true);
        let mut data = self.pool.frames[self.frame_no].data.borrow_mut();
        f(&mut data)
    }

    /// Latch the dirty bit without touching the image.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Drop for PagePin<'_> {
    fn drop(&mut self) {
        let _ = self
            .pool
            .unpin_page(self.file, self.page_no, self.dirty.get());
    }
}
