use std::path::Path;

use log::debug;

use crate::buffer::{BufMgr, PagePin};
use crate::file::{FileId, PageId, INVALID_PAGE_NO};
use crate::relation::{FileScan, RecordId, RelationError, TableFile};

use super::error::{IndexError, IndexResult};
use super::layout::{
    self, IndexMetaInfo, LeafNode, Node, NonLeafNode, LEAF_LEVEL, MAX_LEAF_ENTRIES, MAX_NODE_KEYS,
};
use super::{Datatype, Key, DEFAULT_LEAF_OCCUPANCY, DEFAULT_NODE_OCCUPANCY};

/// Comparison operators for scan bounds. The lower bound accepts `Gt`/`Gte`
/// and the upper bound `Lt`/`Lte`; anything else is rejected with
/// `BadOpcodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Lte,
    Gte,
    Gt,
}

/// State of an active range scan. The current leaf stays pinned between
/// `scan_next` calls; dropping the state releases the pin.
struct ScanState<'a> {
    leaf: PagePin<'a>,
    /// Slot of the next entry to return; -1 once the leaf chain is done
    next_entry: i32,
    incl_low: Key,
    incl_high: Key,
}

/// A B+ tree index over one integer attribute of a relation.
///
/// The index lives in its own paged file named
/// `<relation>.<attr_byte_offset>`. Constructing the index either opens
/// that file (adopting the persisted root) or creates it and bulk-builds it
/// by scanning the relation. Every node access is pinned through the
/// buffer pool and unpinned when the guard leaves scope.
pub struct BTreeIndex<'a> {
    pool: &'a BufMgr,
    file: FileId,
    index_name: String,
    header_page_no: PageId,
    root_page_no: PageId,
    root_level: i32,
    attr_byte_offset: u32,
    leaf_occupancy: usize,
    node_occupancy: usize,
    scan: Option<ScanState<'a>>,
}

impl<'a> BTreeIndex<'a> {
    /// Open or build the index for `relation_name` with the default fanout.
    pub fn new(
        pool: &'a BufMgr,
        relation_name: &str,
        attr_byte_offset: usize,
        attr_type: Datatype,
    ) -> IndexResult<Self> {
        Self::with_fanout(
            pool,
            relation_name,
            attr_byte_offset,
            attr_type,
            DEFAULT_LEAF_OCCUPANCY,
            DEFAULT_NODE_OCCUPANCY,
        )
    }

    /// Open or build the index with explicit node fanouts. An existing
    /// index keeps the fanout it was built with.
    pub fn with_fanout(
        pool: &'a BufMgr,
        relation_name: &str,
        attr_byte_offset: usize,
        attr_type: Datatype,
        leaf_occupancy: usize,
        node_occupancy: usize,
    ) -> IndexResult<Self> {
        if attr_type != Datatype::Integer {
            return Err(IndexError::BadIndexInfo(format!(
                "unsupported attribute type {:?}; only Integer keys are indexed",
                attr_type
            )));
        }

        let index_name = format!("{}.{}", relation_name, attr_byte_offset);

        if Path::new(&index_name).exists() {
            Self::open_existing(pool, relation_name, index_name, attr_byte_offset)
        } else {
            if !(4..=MAX_LEAF_ENTRIES).contains(&leaf_occupancy) {
                return Err(IndexError::BadIndexInfo(format!(
                    "leaf occupancy {} out of range 4..={}",
                    leaf_occupancy, MAX_LEAF_ENTRIES
                )));
            }
            if !(4..=MAX_NODE_KEYS).contains(&node_occupancy) {
                return Err(IndexError::BadIndexInfo(format!(
                    "node occupancy {} out of range 4..={}",
                    node_occupancy, MAX_NODE_KEYS
                )));
            }

            let mut index = Self::create_new(
                pool,
                relation_name,
                index_name,
                attr_byte_offset,
                attr_type,
                leaf_occupancy,
                node_occupancy,
            )?;
            index.build_from_relation(relation_name)?;
            Ok(index)
        }
    }

    fn open_existing(
        pool: &'a BufMgr,
        relation_name: &str,
        index_name: String,
        attr_byte_offset: usize,
    ) -> IndexResult<Self> {
        let file = pool.open_file(&index_name)?;
        let header_page_no = pool.first_page_no(file)?;

        let meta = {
            let pin = pool.read_page(file, header_page_no)?;
            pin.read(layout::decode_meta)?
        };

        if meta.relation_name != relation_name {
            return Err(IndexError::BadIndexInfo(format!(
                "index was built over relation {:?}",
                meta.relation_name
            )));
        }
        if meta.attr_byte_offset != attr_byte_offset as u32 {
            return Err(IndexError::BadIndexInfo(format!(
                "index was built at attribute offset {}",
                meta.attr_byte_offset
            )));
        }
        if meta.attr_type != Datatype::Integer {
            return Err(IndexError::BadIndexInfo(format!(
                "index header declares attribute type {:?}",
                meta.attr_type
            )));
        }
        let leaf_occupancy = meta.leaf_occupancy as usize;
        let node_occupancy = meta.node_occupancy as usize;
        if !(4..=MAX_LEAF_ENTRIES).contains(&leaf_occupancy)
            || !(4..=MAX_NODE_KEYS).contains(&node_occupancy)
        {
            return Err(IndexError::BadIndexInfo(
                "index header declares an impossible fanout".into(),
            ));
        }

        let root_level = {
            let pin = pool.read_page(file, meta.root_page_no)?;
            pin.read(layout::page_level)
        };

        Ok(Self {
            pool,
            file,
            index_name,
            header_page_no,
            root_page_no: meta.root_page_no,
            root_level,
            attr_byte_offset: meta.attr_byte_offset,
            leaf_occupancy,
            node_occupancy,
            scan: None,
        })
    }

    fn create_new(
        pool: &'a BufMgr,
        relation_name: &str,
        index_name: String,
        attr_byte_offset: usize,
        attr_type: Datatype,
        leaf_occupancy: usize,
        node_occupancy: usize,
    ) -> IndexResult<Self> {
        let file = pool.create_file(&index_name)?;

        let (header_page_no, header_pin) = pool.alloc_page(file)?;
        let (root_page_no, root_pin) = pool.alloc_page(file)?;

        root_pin.write(|page| Node::Leaf(LeafNode::new()).encode(page));
        drop(root_pin);

        let meta = IndexMetaInfo {
            relation_name: relation_name.to_string(),
            attr_byte_offset: attr_byte_offset as u32,
            attr_type,
            root_page_no,
            leaf_occupancy: leaf_occupancy as u32,
            node_occupancy: node_occupancy as u32,
        };
        header_pin.write(|page| layout::encode_meta(&meta, page))?;
        drop(header_pin);

        debug!(
            "created index {} (header page {}, root page {})",
            index_name, header_page_no, root_page_no
        );

        Ok(Self {
            pool,
            file,
            index_name,
            header_page_no,
            root_page_no,
            root_level: LEAF_LEVEL,
            attr_byte_offset: attr_byte_offset as u32,
            leaf_occupancy,
            node_occupancy,
            scan: None,
        })
    }

    /// Scan the relation and insert an entry per record, then flush the
    /// index file.
    fn build_from_relation(&mut self, relation_name: &str) -> IndexResult<()> {
        let table = TableFile::open(self.pool, relation_name)?;
        let offset = self.attr_byte_offset as usize;
        if offset + 4 > table.record_len() {
            return Err(IndexError::BadIndexInfo(format!(
                "attribute offset {} overruns {}-byte records",
                offset,
                table.record_len()
            )));
        }

        let mut scan = FileScan::new(&table)?;
        loop {
            match scan.scan_next() {
                Ok((rid, record)) => {
                    let key = i32::from_le_bytes([
                        record[offset],
                        record[offset + 1],
                        record[offset + 2],
                        record[offset + 3],
                    ]);
                    self.insert_entry(key, rid)?;
                }
                Err(RelationError::EndOfFile) => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.pool.flush_file(self.file)?;
        Ok(())
    }

    /// Name of the index file backing this index.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    // ---- insertion ---------------------------------------------------------

    /// Insert a `(key, rid)` entry. Duplicate keys are permitted and kept
    /// in insertion order within a leaf.
    pub fn insert_entry(&mut self, key: Key, rid: RecordId) -> IndexResult<()> {
        if let Some((sep_key, right_page)) = self.insert_into(self.root_page_no, key, rid)? {
            // The root itself split: grow the tree by one level.
            let (new_root_no, pin) = self.pool.alloc_page(self.file)?;
            let new_level = if self.root_level == LEAF_LEVEL {
                1
            } else {
                self.root_level + 1
            };
            let root = NonLeafNode {
                level: new_level,
                keys: vec![sep_key],
                children: vec![self.root_page_no, right_page],
            };
            pin.write(|page| Node::NonLeaf(root).encode(page));
            drop(pin);

            debug!(
                "root split: new root page {} at level {}",
                new_root_no, new_level
            );
            self.root_level = new_level;
            self.set_root(new_root_no)?;
        }
        Ok(())
    }

    /// Recursive insert. Returns the separator and new right page if the
    /// node at `page_no` split; the caller owns inserting that separator
    /// one level up.
    fn insert_into(
        &self,
        page_no: PageId,
        key: Key,
        rid: RecordId,
    ) -> IndexResult<Option<(Key, PageId)>> {
        let pin = self.pool.read_page(self.file, page_no)?;
        let node = pin.read(|page| Node::decode(page_no, page))?;

        match node {
            Node::Leaf(mut leaf) => {
                if leaf.keys.len() < self.leaf_occupancy {
                    leaf.insert(key, rid);
                    pin.write(|page| Node::Leaf(leaf).encode(page));
                    Ok(None)
                } else {
                    let split = self.split_leaf(&mut leaf, key, rid)?;
                    pin.write(|page| Node::Leaf(leaf).encode(page));
                    Ok(Some(split))
                }
            }
            Node::NonLeaf(mut inner) => {
                let child = inner.child_for(key);
                // The node stays pinned while the insert descends.
                match self.insert_into(child, key, rid)? {
                    None => Ok(None),
                    Some((sep_key, right_page)) => {
                        if inner.keys.len() < self.node_occupancy {
                            inner.insert_separator(sep_key, right_page);
                            pin.write(|page| Node::NonLeaf(inner).encode(page));
                            Ok(None)
                        } else {
                            let split = self.split_non_leaf(&mut inner, sep_key, right_page)?;
                            pin.write(|page| Node::NonLeaf(inner).encode(page));
                            Ok(Some(split))
                        }
                    }
                }
            }
        }
    }

    /// Split a full leaf around its midpoint. The upper half moves to a new
    /// right sibling, the pending entry lands in whichever half covers it,
    /// and the first key of the right half is promoted.
    fn split_leaf(
        &self,
        leaf: &mut LeafNode,
        key: Key,
        rid: RecordId,
    ) -> IndexResult<(Key, PageId)> {
        let (new_page_no, new_pin) = self.pool.alloc_page(self.file)?;

        let mid = leaf.keys.len() / 2;
        let mut right = LeafNode {
            keys: leaf.keys.split_off(mid),
            rids: leaf.rids.split_off(mid),
            right_sib: leaf.right_sib,
        };
        leaf.right_sib = new_page_no;

        if key < right.keys[0] {
            leaf.insert(key, rid);
        } else {
            right.insert(key, rid);
        }
        let sep_key = right.keys[0];

        new_pin.write(|page| Node::Leaf(right).encode(page));
        debug!("leaf split: new leaf page {}, separator {}", new_page_no, sep_key);
        Ok((sep_key, new_page_no))
    }

    /// Split a full non-leaf node. The pending separator is placed first,
    /// then the median key moves up and out of both halves; when the
    /// pending separator is itself the median it is promoted directly.
    fn split_non_leaf(
        &self,
        node: &mut NonLeafNode,
        sep_key: Key,
        right_page: PageId,
    ) -> IndexResult<(Key, PageId)> {
        let (new_page_no, new_pin) = self.pool.alloc_page(self.file)?;

        node.insert_separator(sep_key, right_page);
        let mid = node.keys.len() / 2;
        let promoted = node.keys[mid];

        let right = NonLeafNode {
            level: node.level,
            keys: node.keys.split_off(mid + 1),
            children: node.children.split_off(mid + 1),
        };
        // The median separates the halves from the parent now.
        node.keys.pop();

        new_pin.write(|page| Node::NonLeaf(right).encode(page));
        debug!(
            "non-leaf split: new page {}, promoted key {}",
            new_page_no, promoted
        );
        Ok((promoted, new_page_no))
    }

    /// Point the index at a new root, persisting it to the header page.
    fn set_root(&mut self, new_root: PageId) -> IndexResult<()> {
        self.root_page_no = new_root;

        let pin = self.pool.read_page(self.file, self.header_page_no)?;
        let mut meta = pin.read(layout::decode_meta)?;
        meta.root_page_no = new_root;
        pin.write(|page| layout::encode_meta(&meta, page))?;
        Ok(())
    }

    // ---- scans -------------------------------------------------------------

    /// Begin a range scan over `(low_val, low_op) .. (high_val, high_op)`.
    ///
    /// Positions the scan on the first qualifying entry or fails with
    /// `NoSuchKeyFound` if the range holds no keys. An already-running scan
    /// is ended first.
    pub fn start_scan(
        &mut self,
        low_val: Key,
        low_op: Operator,
        high_val: Key,
        high_op: Operator,
    ) -> IndexResult<()> {
        if !matches!(low_op, Operator::Gt | Operator::Gte) {
            return Err(IndexError::BadOpcodes);
        }
        if !matches!(high_op, Operator::Lt | Operator::Lte) {
            return Err(IndexError::BadOpcodes);
        }
        if low_val > high_val {
            return Err(IndexError::BadScanrange);
        }

        if self.scan.is_some() {
            self.scan = None;
        }

        // Fold the operators into inclusive bounds once. A bound that
        // cannot be represented (> i32::MAX, < i32::MIN) matches nothing.
        let incl_low = match low_op {
            Operator::Gt => match low_val.checked_add(1) {
                Some(v) => v,
                None => return Err(IndexError::NoSuchKeyFound),
            },
            _ => low_val,
        };
        let incl_high = match high_op {
            Operator::Lt => match high_val.checked_sub(1) {
                Some(v) => v,
                None => return Err(IndexError::NoSuchKeyFound),
            },
            _ => high_val,
        };

        // Descend to the leaf that may hold incl_low, unpinning each parent
        // before moving down.
        let mut page_no = self.root_page_no;
        let mut pin = self.pool.read_page(self.file, page_no)?;
        loop {
            let node = pin.read(|page| Node::decode(page_no, page))?;
            match node {
                Node::Leaf(_) => break,
                Node::NonLeaf(inner) => {
                    let child = inner.child_for(incl_low);
                    drop(pin);
                    pin = self.pool.read_page(self.file, child)?;
                    page_no = child;
                }
            }
        }

        // Walk the leaf chain to the first entry >= incl_low.
        let entry = loop {
            let num_keys = pin.read(layout::leaf_num_keys);
            let mut found = None;
            for i in 0..num_keys {
                let (k, _) = pin.read(|page| layout::leaf_entry(page, i));
                if k >= incl_low {
                    found = Some((i, k));
                    break;
                }
            }
            if let Some((i, k)) = found {
                if k > incl_high {
                    return Err(IndexError::NoSuchKeyFound);
                }
                break i;
            }

            let right_sib = pin.read(layout::leaf_right_sib);
            if right_sib == INVALID_PAGE_NO {
                return Err(IndexError::NoSuchKeyFound);
            }
            let next = self.pool.read_page(self.file, right_sib)?;
            pin = next;
        };

        self.scan = Some(ScanState {
            leaf: pin,
            next_entry: entry as i32,
            incl_low,
            incl_high,
        });
        Ok(())
    }

    /// Return the rid of the next entry in the range.
    ///
    /// Fails with `ScanNotInitialized` if no scan is active and with
    /// `IndexScanCompleted` once the range is exhausted.
    pub fn scan_next(&mut self) -> IndexResult<RecordId> {
        let scan = self.scan.as_mut().ok_or(IndexError::ScanNotInitialized)?;

        if scan.next_entry < 0 {
            return Err(IndexError::IndexScanCompleted);
        }
        let index = scan.next_entry as usize;
        let (key, rid) = scan.leaf.read(|page| layout::leaf_entry(page, index));
        if key > scan.incl_high {
            return Err(IndexError::IndexScanCompleted);
        }

        // Position on the next entry: same leaf, right sibling, or done.
        let num_keys = scan.leaf.read(layout::leaf_num_keys);
        if index + 1 < num_keys {
            scan.next_entry += 1;
        } else {
            let right_sib = scan.leaf.read(layout::leaf_right_sib);
            if right_sib != INVALID_PAGE_NO {
                scan.leaf = self.pool.read_page(self.file, right_sib)?;
                scan.next_entry = 0;
            } else {
                scan.next_entry = -1;
            }
        }

        Ok(rid)
    }

    /// Terminate the active scan and release its pinned leaf.
    pub fn end_scan(&mut self) -> IndexResult<()> {
        match self.scan.take() {
            Some(_) => Ok(()),
            None => Err(IndexError::ScanNotInitialized),
        }
    }

    // ---- diagnostics -------------------------------------------------------

    /// Levels of non-leaf nodes above the leaves.
    pub fn height(&self) -> IndexResult<u32> {
        self.height_of(self.root_page_no)
    }

    fn height_of(&self, page_no: PageId) -> IndexResult<u32> {
        let pin = self.pool.read_page(self.file, page_no)?;
        let node = pin.read(|page| Node::decode(page_no, page))?;
        drop(pin);

        match node {
            Node::Leaf(_) => Ok(0),
            Node::NonLeaf(inner) => Ok(1 + self.height_of(inner.children[0])?),
        }
    }

    /// Dump the tree to stderr, one node per line. Diagnostic only.
    pub fn print_tree(&self) -> IndexResult<()> {
        self.print_subtree(self.root_page_no, 0)
    }

    fn print_subtree(&self, page_no: PageId, depth: usize) -> IndexResult<()> {
        let pin = self.pool.read_page(self.file, page_no)?;
        let node = pin.read(|page| Node::decode(page_no, page))?;
        drop(pin);

        match node {
            Node::Leaf(leaf) => {
                eprintln!(
                    "{:indent$}leaf {}: {} keys {:?} -> {}",
                    "",
                    page_no,
                    leaf.keys.len(),
                    leaf.keys,
                    if leaf.right_sib == INVALID_PAGE_NO {
                        "end".to_string()
                    } else {
                        leaf.right_sib.to_string()
                    },
                    indent = depth * 2
                );
            }
            Node::NonLeaf(inner) => {
                eprintln!(
                    "{:indent$}node {} (level {}): keys {:?}",
                    "",
                    page_no,
                    inner.level,
                    inner.keys,
                    indent = depth * 2
                );
                for child in &inner.children {
                    self.print_subtree(*child, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for BTreeIndex<'_> {
    fn drop(&mut self) {
        // Release any scan pin, then flush; neither may fail the drop.
        self.scan = None;
        let _ = self.pool.flush_file(self.file);
    }
}
