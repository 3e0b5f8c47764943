use crate::buffer::BufMgr;
use crate::file::{FileId, PageId, PAGE_SIZE};

use super::error::{RelationError, RelationResult};
use super::{RecordId, SlotId};

/// Magic number for table files: "TBLF" in ASCII
const TABLE_MAGIC: u32 = 0x5442_4C46;

/// Current table file version
const TABLE_VERSION: u32 = 1;

/// Bytes reserved at the start of every data page (slot count + padding)
const DATA_PAGE_HEADER: usize = 8;

/// A heap file of fixed-length records.
///
/// Page 0 holds the table header (magic, version, record length); data
/// pages hold a slot count followed by densely packed records. Records are
/// addressed by `RecordId` and never move once inserted.
pub struct TableFile<'a> {
    pool: &'a BufMgr,
    file: FileId,
    path: String,
    record_len: usize,
    records_per_page: usize,
}

impl<'a> TableFile<'a> {
    /// Create a new table file for records of `record_len` bytes.
    pub fn create(pool: &'a BufMgr, path: &str, record_len: usize) -> RelationResult<Self> {
        let max = PAGE_SIZE - DATA_PAGE_HEADER;
        if record_len == 0 || record_len > max {
            return Err(RelationError::RecordTooLarge {
                len: record_len,
                max,
            });
        }

        let file = pool.create_file(path)?;
        let (_header_no, pin) = pool.alloc_page(file)?;
        pin.write(|page| {
            page[0..4].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
            page[4..8].copy_from_slice(&TABLE_VERSION.to_le_bytes());
            page[8..12].copy_from_slice(&(record_len as u32).to_le_bytes());
        });
        drop(pin);

        Ok(Self {
            pool,
            file,
            path: path.to_string(),
            record_len,
            records_per_page: max / record_len,
        })
    }

    /// Open an existing table file, reading the record length from its
    /// header page.
    pub fn open(pool: &'a BufMgr, path: &str) -> RelationResult<Self> {
        let file = pool.open_file(path)?;
        let header_no = pool.first_page_no(file)?;

        let pin = pool.read_page(file, header_no)?;
        let (magic, version, record_len) = pin.read(|page| {
            (
                u32::from_le_bytes([page[0], page[1], page[2], page[3]]),
                u32::from_le_bytes([page[4], page[5], page[6], page[7]]),
                u32::from_le_bytes([page[8], page[9], page[10], page[11]]) as usize,
            )
        });
        drop(pin);

        if magic != TABLE_MAGIC {
            return Err(RelationError::InvalidHeader("bad magic number".into()));
        }
        if version != TABLE_VERSION {
            return Err(RelationError::InvalidHeader(format!(
                "unsupported version {}",
                version
            )));
        }
        let max = PAGE_SIZE - DATA_PAGE_HEADER;
        if record_len == 0 || record_len > max {
            return Err(RelationError::InvalidHeader(format!(
                "record length {} out of range",
                record_len
            )));
        }

        Ok(Self {
            pool,
            file,
            path: path.to_string(),
            record_len,
            records_per_page: max / record_len,
        })
    }

    /// Append a record, returning its id.
    pub fn insert_record(&mut self, record: &[u8]) -> RelationResult<RecordId> {
        if record.len() != self.record_len {
            return Err(RelationError::WrongRecordLength {
                expected: self.record_len,
                actual: record.len(),
            });
        }

        let page_count = self.pool.file_page_count(self.file)?;
        let last_data_page = if page_count > 1 {
            Some(page_count - 1)
        } else {
            None
        };

        // Append to the last data page if it still has room, otherwise
        // start a new one.
        if let Some(page_no) = last_data_page {
            let pin = self.pool.read_page(self.file, page_no)?;
            let slots = pin.read(|page| u16::from_le_bytes([page[0], page[1]]) as usize);
            if slots < self.records_per_page {
                let offset = DATA_PAGE_HEADER + slots * self.record_len;
                pin.write(|page| {
                    page[offset..offset + self.record_len].copy_from_slice(record);
                    page[0..2].copy_from_slice(&((slots + 1) as u16).to_le_bytes());
                });
                return Ok(RecordId::new(page_no, slots as SlotId));
            }
        }

        let (page_no, pin) = self.pool.alloc_page(self.file)?;
        pin.write(|page| {
            page[DATA_PAGE_HEADER..DATA_PAGE_HEADER + self.record_len].copy_from_slice(record);
            page[0..2].copy_from_slice(&1u16.to_le_bytes());
        });
        Ok(RecordId::new(page_no, 0))
    }

    /// Fetch a record by id.
    pub fn read_record(&self, rid: RecordId) -> RelationResult<Vec<u8>> {
        let pin = self.pool.read_page(self.file, rid.page_no)?;
        pin.read(|page| {
            let slots = u16::from_le_bytes([page[0], page[1]]);
            if rid.slot_no >= slots {
                return Err(RelationError::InvalidRid {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                });
            }
            let offset = DATA_PAGE_HEADER + rid.slot_no as usize * self.record_len;
            Ok(page[offset..offset + self.record_len].to_vec())
        })
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_id(&self) -> FileId {
        self.file
    }

    /// Write all cached pages of this table back to disk.
    pub fn flush(&self) -> RelationResult<()> {
        self.pool.flush_file(self.file)?;
        Ok(())
    }
}

/// Forward scan over every record of a table.
///
/// Each step pins the page it touches, copies the record out and unpins
/// before returning, so the scan never holds buffer frames between calls.
pub struct FileScan<'a> {
    pool: &'a BufMgr,
    file: FileId,
    record_len: usize,
    records_per_page: usize,
    page_count: u32,
    current_page: PageId,
    next_slot: usize,
}

impl<'a> FileScan<'a> {
    pub fn new(table: &TableFile<'a>) -> RelationResult<Self> {
        let page_count = table.pool.file_page_count(table.file)?;
        Ok(Self {
            pool: table.pool,
            file: table.file,
            record_len: table.record_len,
            records_per_page: table.records_per_page,
            page_count,
            current_page: 1,
            next_slot: 0,
        })
    }

    /// Return the next record, or `EndOfFile` once the table is exhausted.
    pub fn scan_next(&mut self) -> RelationResult<(RecordId, Vec<u8>)> {
        loop {
            if self.current_page >= self.page_count {
                return Err(RelationError::EndOfFile);
            }

            let pin = self.pool.read_page(self.file, self.current_page)?;
            let slots = pin.read(|page| u16::from_le_bytes([page[0], page[1]]) as usize);

            if self.next_slot >= slots || self.next_slot >= self.records_per_page {
                drop(pin);
                self.current_page += 1;
                self.next_slot = 0;
                continue;
            }

            let offset = DATA_PAGE_HEADER + self.next_slot * self.record_len;
            let record = pin.read(|page| page[offset..offset + self.record_len].to_vec());
            let rid = RecordId::new(self.current_page, self.next_slot as SlotId);
            self.next_slot += 1;
            return Ok((rid, record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BufMgr) {
        (tempfile::tempdir().unwrap(), BufMgr::new(16))
    }

    fn record(key: i32, tag: u8) -> Vec<u8> {
        let mut r = vec![tag; 16];
        r[0..4].copy_from_slice(&key.to_le_bytes());
        r
    }

    #[test]
    fn insert_and_read_back() {
        let (dir, pool) = setup();
        let path = dir.path().join("t.rel").display().to_string();
        let mut table = TableFile::create(&pool, &path, 16).unwrap();

        let rid_a = table.insert_record(&record(1, 0xaa)).unwrap();
        let rid_b = table.insert_record(&record(2, 0xbb)).unwrap();
        assert_ne!(rid_a, rid_b);

        assert_eq!(table.read_record(rid_a).unwrap(), record(1, 0xaa));
        assert_eq!(table.read_record(rid_b).unwrap(), record(2, 0xbb));
    }

    #[test]
    fn wrong_record_length_rejected() {
        let (dir, pool) = setup();
        let path = dir.path().join("t.rel").display().to_string();
        let mut table = TableFile::create(&pool, &path, 16).unwrap();

        let result = table.insert_record(&[0u8; 8]);
        assert!(matches!(
            result,
            Err(RelationError::WrongRecordLength {
                expected: 16,
                actual: 8
            })
        ));
    }

    #[test]
    fn scan_visits_every_record_in_insertion_order() {
        let (dir, pool) = setup();
        let path = dir.path().join("t.rel").display().to_string();
        let mut table = TableFile::create(&pool, &path, 16).unwrap();

        let mut rids = Vec::new();
        for i in 0..100 {
            rids.push(table.insert_record(&record(i, 1)).unwrap());
        }

        let mut scan = FileScan::new(&table).unwrap();
        for (i, expected_rid) in rids.iter().enumerate() {
            let (rid, rec) = scan.scan_next().unwrap();
            assert_eq!(rid, *expected_rid);
            assert_eq!(&rec, &record(i as i32, 1));
        }
        assert!(matches!(scan.scan_next(), Err(RelationError::EndOfFile)));
    }

    #[test]
    fn scan_crosses_page_boundaries() {
        let (dir, pool) = setup();
        let path = dir.path().join("t.rel").display().to_string();
        // Records sized so exactly two fit per page.
        let len = (PAGE_SIZE - DATA_PAGE_HEADER) / 2;
        let mut table = TableFile::create(&pool, &path, len).unwrap();

        for i in 0..5u8 {
            table.insert_record(&vec![i; len]).unwrap();
        }

        let mut scan = FileScan::new(&table).unwrap();
        let mut seen = Vec::new();
        let mut pages = Vec::new();
        while let Ok((rid, rec)) = scan.scan_next() {
            seen.push(rec[0]);
            pages.push(rid.page_no);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(pages, vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn reopen_preserves_record_len_and_data() {
        let (dir, pool) = setup();
        let path = dir.path().join("t.rel").display().to_string();

        let rid = {
            let mut table = TableFile::create(&pool, &path, 16).unwrap();
            let rid = table.insert_record(&record(7, 3)).unwrap();
            table.flush().unwrap();
            rid
        };

        let table = TableFile::open(&pool, &path).unwrap();
        assert_eq!(table.record_len(), 16);
        assert_eq!(table.read_record(rid).unwrap(), record(7, 3));
    }

    #[test]
    fn pin_balance_after_operations() {
        let (dir, pool) = setup();
        let path = dir.path().join("t.rel").display().to_string();
        let mut table = TableFile::create(&pool, &path, 16).unwrap();

        for i in 0..50 {
            table.insert_record(&record(i, 1)).unwrap();
        }
        let mut scan = FileScan::new(&table).unwrap();
        while scan.scan_next().is_ok() {}

        assert_eq!(pool.pinned_frame_count(), 0);
    }
}
