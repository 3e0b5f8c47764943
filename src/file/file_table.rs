use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::blob_file::BlobFile;
use super::error::{FileError, FileResult};

/// Handle to an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

impl FileId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Registry of open paged files.
///
/// Maps paths to handles so a file opened twice yields the same `FileId`,
/// and keeps the `BlobFile` instances reachable by handle for page I/O.
pub struct FileTable {
    open_files: HashMap<FileId, BlobFile>,
    path_to_id: HashMap<PathBuf, FileId>,
    next_id: u32,
    max_open_files: usize,
}

impl FileTable {
    pub fn new() -> Self {
        Self::with_max_files(128)
    }

    pub fn with_max_files(max_open_files: usize) -> Self {
        Self {
            open_files: HashMap::new(),
            path_to_id: HashMap::new(),
            next_id: 0,
            max_open_files,
        }
    }

    /// Create a new paged file and register it.
    pub fn create_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<FileId> {
        let file = BlobFile::create(path)?;
        self.register(file)
    }

    /// Open an existing paged file, reusing the handle if already open.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<FileId> {
        let path_ref = path.as_ref();
        let canonical = path_ref
            .canonicalize()
            .map_err(|_| FileError::FileNotFound(path_ref.display().to_string()))?;

        if let Some(&id) = self.path_to_id.get(&canonical) {
            return Ok(id);
        }

        let file = BlobFile::open(&canonical)?;
        self.register(file)
    }

    fn register(&mut self, file: BlobFile) -> FileResult<FileId> {
        if self.open_files.len() >= self.max_open_files {
            return Err(FileError::TooManyOpenFiles);
        }

        // Freshly created files cannot be canonicalized before they exist,
        // so resolve the path here where the file is guaranteed on disk.
        let canonical = file
            .filename()
            .canonicalize()
            .unwrap_or_else(|_| file.filename().to_path_buf());

        let id = FileId(self.next_id);
        self.next_id += 1;

        self.open_files.insert(id, file);
        self.path_to_id.insert(canonical, id);
        Ok(id)
    }

    /// Close a file, dropping its handle.
    pub fn close_file(&mut self, id: FileId) -> FileResult<()> {
        let file = self
            .open_files
            .remove(&id)
            .ok_or(FileError::UnknownFile(id.0))?;

        let canonical = file
            .filename()
            .canonicalize()
            .unwrap_or_else(|_| file.filename().to_path_buf());
        self.path_to_id.remove(&canonical);
        Ok(())
    }

    /// Access an open file by handle.
    pub fn get(&mut self, id: FileId) -> FileResult<&mut BlobFile> {
        self.open_files
            .get_mut(&id)
            .ok_or(FileError::UnknownFile(id.0))
    }

    pub fn is_open(&self, id: FileId) -> bool {
        self.open_files.contains_key(&id)
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
