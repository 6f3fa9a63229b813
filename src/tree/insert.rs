//! Insertion pipeline: append to the rightmost leaf, compressing or
//! splitting when it is full, with downlink propagation up the tree.

use smallvec::SmallVec;
use tracing::trace;

use crate::mvcc::RowHeader;
use crate::store::PageWriteGuard;
use crate::types::{PageId, Result, Rid, StrataError};

use super::compress::compress_leaf;
use super::page::{
    Downlink, InternalPage, LeafItem, LeafPage, PageHeader, PlainItem, SplitState, HEADER_LEN,
    ITEM_HEADER_LEN,
};
use super::ColumnTree;

impl ColumnTree {
    /// Appends a new row value to this attribute and returns its assigned
    /// row id.
    ///
    /// The first attribute must supply the row header that carries the
    /// row's MVCC bookkeeping; every other attribute must not.
    pub fn insert(&self, value: &[u8], row_header: Option<&RowHeader>) -> Result<Rid> {
        match (self.attno.is_first(), row_header) {
            (true, None) => {
                return Err(StrataError::Invalid(
                    "first attribute requires a row header",
                ))
            }
            (false, Some(_)) => {
                return Err(StrataError::Invalid(
                    "row headers belong to the first attribute only",
                ))
            }
            _ => {}
        }
        let root = self.root_for_write()?;
        let leaf = self.find_insertion_target(root)?;
        let rid = self.insert_to_leaf(leaf, value, row_header)?;
        self.stats.inc_inserts();
        Ok(rid)
    }

    /// Picks the leaf new rows go to: always the rightmost one. Rows get
    /// the next tail row id, so there is no free-space-driven placement.
    fn find_insertion_target(&self, root: PageId) -> Result<PageWriteGuard> {
        self.descend(root, Rid::MAX_ITEM)
    }

    fn insert_to_leaf(
        &self,
        mut guard: PageWriteGuard,
        value: &[u8],
        row_header: Option<&RowHeader>,
    ) -> Result<Rid> {
        let page_size = self.store.page_size();
        let mut leaf = LeafPage::parse(guard.data())?;

        let rid = match leaf.items.last() {
            Some(item) => item.last_rid().next(),
            None => leaf.header.low_key,
        };

        let mut payload = Vec::with_capacity(value.len());
        if let Some(header) = row_header {
            header.encode_into(&mut payload);
        }
        payload.extend_from_slice(value);
        let item = PlainItem {
            rid,
            flags: 0,
            payload,
        };
        let item_len = ITEM_HEADER_LEN + item.payload.len();
        if HEADER_LEN + item_len > page_size {
            return Err(StrataError::Unsupported(
                "value does not fit on an empty page",
            ));
        }

        if !leaf.fits(item_len, page_size) {
            self.stats.inc_compress_attempts();
            if compress_leaf(&mut guard)? {
                self.stats.inc_compress_applied();
            }
            leaf = LeafPage::parse(guard.data())?;
        }

        if leaf.fits(item_len, page_size) {
            leaf.items.push(LeafItem::Plain(item));
            leaf.write_to(guard.data_mut())?;
            guard.mark_dirty();
            return Ok(rid);
        }

        // Still no room: tail-split the leaf, carrying the new item. All
        // existing items stay on the left half.
        let last_left = leaf.items.len();
        let new_off = leaf.items.len();
        self.split_leaf(guard, leaf, last_left, item, new_off)?;
        Ok(rid)
    }

    /// Splits the leaf under `guard` for insertion of `new_item`.
    ///
    /// Existing items up to (exclusive) `last_left_off` stay on the left
    /// half; the rest move right. The new item is inserted at `new_off`,
    /// on the side whose key range contains its row id. The left page
    /// keeps the original identity and enters `SplitPending` until the
    /// right sibling's downlink is installed.
    fn split_leaf(
        &self,
        mut guard: PageWriteGuard,
        orig: LeafPage,
        last_left_off: usize,
        new_item: PlainItem,
        new_off: usize,
    ) -> Result<()> {
        if orig.header.state == SplitState::SplitPending {
            return Err(StrataError::Corruption(
                "splitting a page whose previous split is unfinished",
            ));
        }
        let split_rid = leaf_split_rid(&orig, last_left_off, new_item.rid)?;
        let new_on_left = new_item.rid < split_rid;

        let right_id = self.store.allocate()?;
        let mut right_guard = self.store.lock_exclusive(right_id)?;

        let mut left = LeafPage {
            header: PageHeader {
                level: 0,
                state: SplitState::SplitPending,
                next: Some(right_id),
                low_key: orig.header.low_key,
                high_key: split_rid,
                item_count: 0,
            },
            items: Vec::new(),
        };
        let mut right = LeafPage {
            header: PageHeader {
                level: 0,
                state: SplitState::Committed,
                next: orig.header.next,
                low_key: split_rid,
                high_key: orig.header.high_key,
                item_count: 0,
            },
            items: Vec::new(),
        };

        let orig_len = orig.items.len();
        let new_item = LeafItem::Plain(new_item);
        for (idx, item) in orig.items.into_iter().enumerate() {
            if idx == new_off {
                let side = if new_on_left { &mut left } else { &mut right };
                side.items.push(new_item.clone());
            }
            let side = if idx < last_left_off { &mut left } else { &mut right };
            side.items.push(item);
        }
        if new_off >= orig_len {
            let side = if new_on_left { &mut left } else { &mut right };
            side.items.push(new_item);
        }

        left.write_to(guard.data_mut())?;
        guard.mark_dirty();
        right.write_to(right_guard.data_mut())?;
        right_guard.mark_dirty();

        self.stats.inc_leaf_splits();
        trace!(
            target: "strata::split",
            left = guard.id().0,
            right = right_id.0,
            at = %split_rid,
            "split leaf page"
        );

        drop(right_guard);
        self.insert_downlink(guard, split_rid, right_id)
    }

    /// Links a freshly split-off right sibling into its parent, looping
    /// upward as long as parents overflow in turn. The loop ends by
    /// inserting into a parent with room or by installing a new root;
    /// either way the split child's pending state is cleared.
    fn insert_downlink(
        &self,
        mut left: PageWriteGuard,
        mut right_key: Rid,
        mut right_id: PageId,
    ) -> Result<()> {
        loop {
            let left_header = PageHeader::parse(left.data())?;
            let left_id = left.id();
            let Some((mut parent_guard, idx)) =
                self.find_downlink(left_header.low_key, left_id, left_header.level)?
            else {
                return self.install_new_root(left, &left_header, right_key, right_id);
            };
            let mut parent = InternalPage::parse(parent_guard.data())?;
            let entry = parent.items[idx];
            if entry.key != left_header.low_key || entry.child != left_id {
                return Err(StrataError::Corruption(
                    "parent entry does not match the split child",
                ));
            }
            let insert_at = idx + 1;

            if !parent.is_full(self.store.page_size()) {
                parent.items.insert(
                    insert_at,
                    Downlink {
                        key: right_key,
                        child: right_id,
                    },
                );
                parent.write_to(parent_guard.data_mut())?;
                parent_guard.mark_dirty();
                clear_split_pending(&mut left)?;
                return Ok(());
            }

            let (next_left, next_key, next_right) =
                self.split_internal(parent_guard, parent, insert_at, right_key, right_id, left)?;
            left = next_left;
            right_key = next_key;
            right_id = next_right;
        }
    }

    /// Splits a full internal page to make room for a new downlink.
    ///
    /// Returns the left half (still latched and `SplitPending`) together
    /// with the split key and right page id, for the caller to link one
    /// level further up. `child_guard` is the page whose split this
    /// downlink completes; its pending state is cleared here.
    fn split_internal(
        &self,
        mut guard: PageWriteGuard,
        orig: InternalPage,
        new_off: usize,
        new_key: Rid,
        new_child: PageId,
        mut child_guard: PageWriteGuard,
    ) -> Result<(PageWriteGuard, Rid, PageId)> {
        if orig.header.state == SplitState::SplitPending {
            return Err(StrataError::Corruption(
                "splitting a page whose previous split is unfinished",
            ));
        }
        let orig_len = orig.items.len();
        if orig_len < 2 {
            return Err(StrataError::Corruption(
                "cannot split an internal page with fewer than two downlinks",
            ));
        }
        let fraction = self.options.internal_split_fraction;
        let split_point = ((orig_len as f64) * fraction) as usize;
        let split_point = split_point.clamp(1, orig_len - 1);
        let split_key = orig.items[split_point].key;
        let new_on_left = new_key < split_key;

        let right_id = self.store.allocate()?;
        let mut right_guard = self.store.lock_exclusive(right_id)?;

        let mut left = InternalPage {
            header: PageHeader {
                level: orig.header.level,
                state: SplitState::SplitPending,
                next: Some(right_id),
                low_key: orig.header.low_key,
                high_key: split_key,
                item_count: 0,
            },
            items: SmallVec::new(),
        };
        let mut right = InternalPage {
            header: PageHeader {
                level: orig.header.level,
                state: SplitState::Committed,
                next: orig.header.next,
                low_key: split_key,
                high_key: orig.header.high_key,
                item_count: 0,
            },
            items: SmallVec::new(),
        };

        let new_link = Downlink {
            key: new_key,
            child: new_child,
        };
        for (idx, link) in orig.items.iter().enumerate() {
            if idx == new_off {
                let side = if new_on_left { &mut left } else { &mut right };
                side.items.push(new_link);
            }
            let side = if idx < split_point { &mut left } else { &mut right };
            side.items.push(*link);
        }
        if new_off >= orig_len {
            debug_assert!(!new_on_left);
            right.items.push(new_link);
        }
        debug_assert_eq!(left.items.len() + right.items.len(), orig_len + 1);

        left.write_to(guard.data_mut())?;
        guard.mark_dirty();
        right.write_to(right_guard.data_mut())?;
        right_guard.mark_dirty();

        // The child's split is complete once its downlink chain reaches
        // a durable parent entry; that happened into one of the two new
        // halves just built.
        clear_split_pending(&mut child_guard)?;
        drop(child_guard);
        drop(right_guard);

        self.stats.inc_internal_splits();
        trace!(
            target: "strata::split",
            left = guard.id().0,
            right = right_id.0,
            at = %split_key,
            "split internal page"
        );
        Ok((guard, split_key, right_id))
    }

    /// Installs a fresh root one level above a split pair, with two
    /// downlinks spanning the whole key space.
    fn install_new_root(
        &self,
        mut left: PageWriteGuard,
        left_header: &PageHeader,
        right_key: Rid,
        right_id: PageId,
    ) -> Result<()> {
        if left_header.low_key >= right_key {
            return Err(StrataError::Corruption("new root downlinks out of order"));
        }
        let root_id = self.store.allocate()?;
        let mut root_guard = self.store.lock_exclusive(root_id)?;
        let root = InternalPage {
            header: PageHeader {
                level: left_header.level + 1,
                state: SplitState::Committed,
                next: None,
                low_key: Rid::MIN_KEY,
                high_key: Rid::MAX_KEY,
                item_count: 0,
            },
            items: SmallVec::from_vec(vec![
                Downlink {
                    key: left_header.low_key,
                    child: left.id(),
                },
                Downlink {
                    key: right_key,
                    child: right_id,
                },
            ]),
        };
        root.write_to(root_guard.data_mut())?;
        root_guard.mark_dirty();
        clear_split_pending(&mut left)?;

        self.directory.set_root(self.attno, root_id)?;
        self.stats.inc_new_roots();
        trace!(
            target: "strata::split",
            attno = self.attno.0,
            root = root_id.0,
            left = left.id().0,
            right = right_id.0,
            "installed new root"
        );
        Ok(())
    }
}

/// Chooses the split row id for a leaf tail split.
///
/// The append policy point is one past the leaf's low-key major unit, but
/// never below the first row id moving right (so left-bound items stay in
/// range) and never above the incoming row id (so the new item lands on a
/// side whose range contains it).
fn leaf_split_rid(orig: &LeafPage, last_left_off: usize, new_rid: Rid) -> Result<Rid> {
    let low = orig.header.low_key;
    let policy = if low.major == u32::MAX {
        Rid::MAX_ITEM
    } else {
        Rid::new(low.major + 1, 1)
    };
    let mut split_rid = policy.min(new_rid);
    let floor = match last_left_off.checked_sub(1).and_then(|i| orig.items.get(i)) {
        Some(item) => item.last_rid().next(),
        None => low.next(),
    };
    if split_rid < floor {
        split_rid = floor;
    }
    if split_rid <= low || split_rid >= orig.header.high_key {
        return Err(StrataError::Corruption("leaf split point out of page bounds"));
    }
    Ok(split_rid)
}

/// Marks a page's split as complete by rewriting its header state.
fn clear_split_pending(guard: &mut PageWriteGuard) -> Result<()> {
    let mut header = PageHeader::parse(guard.data())?;
    header.state = SplitState::Committed;
    header.write_to(guard.data_mut());
    guard.mark_dirty();
    Ok(())
}
