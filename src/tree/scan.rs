//! Forward scan cursor and the delete-scan variant.

use crate::mvcc::{DeleteMutator, RowHeader, Snapshot, VisibilityOracle, ROW_HEADER_LEN};
use crate::types::{PageId, Result, Rid, StrataError};

use super::codec::DecompressIter;
use super::page::{LeafItem, LeafPage, PlainItem};
use super::ColumnTree;

/// One row produced by a scan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanItem {
    /// Row id of the value.
    pub rid: Rid,
    /// Raw value bytes (row header stripped on the first attribute).
    pub value: Vec<u8>,
    /// Whether the row is visible to the scan's snapshot. Always `true`
    /// for attributes other than the first; visibility is a row property
    /// centralized on the attribute that carries the row headers.
    pub visible: bool,
}

/// Resumable forward iterator over one attribute in row-id order.
///
/// The cursor holds no page latch between calls: each visit shared-locks
/// the current leaf, rescans its item list from the start, and releases
/// the latch before decompressing a run or hopping to a sibling. The page
/// id and next-expected row id carried across the unlocked gaps make the
/// cursor robust against concurrent splits of the pages it revisits.
pub struct TreeScan<'t> {
    tree: &'t ColumnTree,
    oracle: &'t dyn VisibilityOracle,
    snapshot: Snapshot,
    active: bool,
    page: Option<PageId>,
    next_rid: Rid,
    stream: Option<DecompressIter>,
}

impl ColumnTree {
    /// Opens a scan starting at `start`. An attribute with no root yields
    /// an inactive cursor that immediately reports end-of-scan.
    pub fn begin_scan<'t>(
        &'t self,
        start: Rid,
        snapshot: Snapshot,
        oracle: &'t dyn VisibilityOracle,
    ) -> Result<TreeScan<'t>> {
        let Some(root) = self.root()? else {
            return Ok(TreeScan {
                tree: self,
                oracle,
                snapshot,
                active: false,
                page: None,
                next_rid: start,
                stream: None,
            });
        };
        let guard = self.descend(root, start)?;
        let page = guard.id();
        drop(guard);
        Ok(TreeScan {
            tree: self,
            oracle,
            snapshot,
            active: true,
            page: Some(page),
            next_rid: start,
            stream: None,
        })
    }

    /// Locates `rid` on the first attribute and delegates the deletion
    /// marking to `mutator`, rewriting the row header in place.
    ///
    /// Returns `false` when the tree holds no such row. A compressed run
    /// covering the target is a documented gap and surfaces as
    /// [`StrataError::Unsupported`].
    pub fn delete(&self, rid: Rid, mutator: &dyn DeleteMutator) -> Result<bool> {
        if !self.attno.is_first() {
            return Err(StrataError::Invalid(
                "deletes run against the first attribute only",
            ));
        }
        let Some(root) = self.root()? else {
            return Ok(false);
        };
        let mut guard = self.descend(root, rid)?;
        loop {
            let mut leaf = LeafPage::parse(guard.data())?;
            let mut found: Option<usize> = None;
            for (idx, item) in leaf.items.iter().enumerate() {
                match item {
                    LeafItem::Compressed(run) if run.last >= rid => {
                        if run.first <= rid {
                            return Err(StrataError::Unsupported(
                                "delete inside a compressed run",
                            ));
                        }
                        // Walked past where the row would sit.
                        return Ok(false);
                    }
                    LeafItem::Plain(plain) if plain.rid >= rid => {
                        if plain.rid > rid {
                            return Ok(false);
                        }
                        found = Some(idx);
                        break;
                    }
                    _ => {}
                }
            }
            if let Some(idx) = found {
                let LeafItem::Plain(plain) = &mut leaf.items[idx] else {
                    return Err(StrataError::Corruption("delete target changed shape"));
                };
                let mut header = RowHeader::decode(&plain.payload)?;
                mutator.mark_deleted(&mut header, rid)?;
                plain.payload[..ROW_HEADER_LEN].copy_from_slice(&header.encode());
                leaf.write_to(guard.data_mut())?;
                guard.mark_dirty();
                return Ok(true);
            }

            let next = leaf.header.next;
            if next == Some(guard.id()) {
                return Err(StrataError::Corruption(
                    "sibling pointer points at its own page",
                ));
            }
            drop(guard);
            match next {
                Some(sibling) => guard = self.store.lock_exclusive(sibling)?,
                None => return Ok(false),
            }
        }
    }
}

impl<'t> TreeScan<'t> {
    /// Returns the next row at or after the scan position, or `None` at
    /// the end of the attribute.
    pub fn next(&mut self) -> Result<Option<ScanItem>> {
        if !self.active {
            return Ok(None);
        }
        loop {
            // Drain an open decompression stream first.
            if self.stream.is_some() {
                if let Some(item) = self.pull_from_stream()? {
                    let page = self
                        .page
                        .ok_or(StrataError::Corruption("scan stream without a page"))?;
                    let tuple = self.materialize(&item, page)?;
                    self.next_rid = item.rid.next();
                    return Ok(Some(tuple));
                }
                self.stream = None;
            }

            // Rescan the current leaf from the start, then walk right.
            loop {
                let Some(page_id) = self.page else {
                    self.end();
                    return Ok(None);
                };
                let guard = self.tree.store.lock_shared(page_id)?;
                let leaf = LeafPage::parse(guard.data())?;
                let mut open_run = None;
                let mut hit: Option<PlainItem> = None;
                for item in &leaf.items {
                    match item {
                        LeafItem::Compressed(run) if run.last >= self.next_rid => {
                            open_run = Some(run.clone());
                            break;
                        }
                        LeafItem::Plain(plain) if plain.rid >= self.next_rid => {
                            hit = Some(plain.clone());
                            break;
                        }
                        _ => {}
                    }
                }
                let next = leaf.header.next;
                drop(guard);

                if let Some(plain) = hit {
                    let tuple = self.materialize(&plain, page_id)?;
                    self.next_rid = plain.rid.next();
                    return Ok(Some(tuple));
                }
                if let Some(run) = open_run {
                    // Decode outside the page latch; the outer loop pulls
                    // rows from the stream.
                    self.stream = Some(DecompressIter::open(&run)?);
                    break;
                }
                match next {
                    Some(sibling) if sibling == page_id => {
                        return Err(StrataError::Corruption(
                            "sibling pointer points at its own page",
                        ));
                    }
                    Some(sibling) => self.page = Some(sibling),
                    None => {
                        self.end();
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Deactivates the cursor early. Further calls to
    /// [`next`](Self::next) report end-of-scan.
    pub fn end(&mut self) {
        self.active = false;
        self.page = None;
        self.stream = None;
    }

    /// Returns `true` while the cursor can still produce rows.
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn pull_from_stream(&mut self) -> Result<Option<PlainItem>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        while let Some(item) = stream.next_item()? {
            if item.rid >= self.next_rid {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn materialize(&self, item: &PlainItem, page: PageId) -> Result<ScanItem> {
        if self.tree.attno.is_first() {
            let header = RowHeader::decode(&item.payload)?;
            let visible = self
                .oracle
                .is_visible(&header, item.rid, self.snapshot, page);
            Ok(ScanItem {
                rid: item.rid,
                value: item.payload[ROW_HEADER_LEN..].to_vec(),
                visible,
            })
        } else {
            Ok(ScanItem {
                rid: item.rid,
                value: item.payload.clone(),
                visible: true,
            })
        }
    }
}
