//! The per-attribute B+ tree: descent, insertion, compression, scans.
//!
//! One [`ColumnTree`] manages the tree of a single attribute. Keys are row
//! ids assigned by the tree itself; inserts always append at the tail, and
//! splits propagate upward through an explicit loop rather than recursion.
//! A page being split carries the `SplitPending` state until its right
//! sibling's downlink lands in the parent; any traversal that finds its key
//! at or above a page's high key reroutes through the sibling pointer, so
//! multi-page splits stay invisible to concurrent operations.
//!
//! Locking follows one rule throughout: child before parent, left before
//! right. Descent takes exclusive latches (shared-mode descent for pure
//! readers is a known refinement this engine does not implement).

use std::sync::Arc;

use tracing::trace;

use crate::store::{PageStore, PageWriteGuard, RootDirectory};
use crate::types::{AttrNumber, PageId, Result, Rid, StrataError};

mod codec;
mod compress;
mod insert;
pub mod page;
mod scan;
mod stats;

pub use codec::{BatchCompressor, DecompressIter};
pub use scan::{ScanItem, TreeScan};
pub use stats::{TreeStats, TreeStatsSnapshot};

use page::{InternalPage, LeafPage, PageHeader};

/// Tuning knobs for one tree.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Fraction of an overflowing internal page's downlinks kept on the
    /// left half. The default favors the left heavily, matching the
    /// append-only insertion pattern; 0.5 yields a balanced split.
    pub internal_split_fraction: f64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            internal_split_fraction: 0.9,
        }
    }
}

impl TreeOptions {
    /// Sets the internal split fraction.
    pub fn internal_split_fraction(mut self, fraction: f64) -> Self {
        self.internal_split_fraction = fraction;
        self
    }
}

/// B+ tree over the values of one attribute.
pub struct ColumnTree {
    store: Arc<dyn PageStore>,
    directory: Arc<dyn RootDirectory>,
    attno: AttrNumber,
    options: TreeOptions,
    stats: TreeStats,
}

impl ColumnTree {
    /// Binds a tree to its attribute, page store and root directory.
    pub fn new(
        store: Arc<dyn PageStore>,
        directory: Arc<dyn RootDirectory>,
        attno: AttrNumber,
        options: TreeOptions,
    ) -> Self {
        Self {
            store,
            directory,
            attno,
            options,
            stats: TreeStats::default(),
        }
    }

    /// The attribute this tree stores.
    pub fn attno(&self) -> AttrNumber {
        self.attno
    }

    /// Copies the tree's operation counters.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// The row id the next insert into this attribute would be assigned.
    pub fn next_rid(&self) -> Result<Rid> {
        let Some(root) = self.directory.get_root(self.attno)? else {
            return Ok(Rid::MIN_KEY);
        };
        let guard = self.descend(root, Rid::MAX_ITEM)?;
        let leaf = LeafPage::parse(guard.data())?;
        Ok(match leaf.items.last() {
            Some(item) => item.last_rid().next(),
            None => leaf.header.low_key,
        })
    }

    /// Current root of this attribute, if any.
    pub(crate) fn root(&self) -> Result<Option<PageId>> {
        self.directory.get_root(self.attno)
    }

    /// Current root, lazily creating an empty leaf root for the first
    /// insert. Runs under the directory's lock so creation is observed
    /// atomically with the registration.
    pub(crate) fn root_for_write(&self) -> Result<PageId> {
        let store = Arc::clone(&self.store);
        let attno = self.attno;
        self.directory.get_or_create_root(attno, &mut || {
            let id = store.allocate()?;
            let mut guard = store.lock_exclusive(id)?;
            LeafPage::empty(Rid::MIN_KEY, Rid::MAX_KEY).write_to(guard.data_mut())?;
            guard.mark_dirty();
            trace!(target: "strata::tree", attno = attno.0, page = id.0, "created root leaf");
            Ok(id)
        })
    }

    /// Walks from `root` down to the leaf that must contain `key`,
    /// returning it exclusively latched.
    ///
    /// A key at or above a page's high key means a concurrent split moved
    /// the target right; the walk follows the sibling pointer at the same
    /// level. On downlink hops the level must decrease by exactly one;
    /// any other level is corruption.
    pub(crate) fn descend(&self, root: PageId, key: Rid) -> Result<PageWriteGuard> {
        self.stats.inc_descents();
        let mut next = root;
        let mut expected_level: Option<u16> = None;
        loop {
            let guard = self.store.lock_exclusive(next)?;
            let header = PageHeader::parse(guard.data())?;
            match expected_level {
                None => expected_level = Some(header.level),
                Some(expected) if header.level != expected => {
                    return Err(StrataError::Corruption(
                        "unexpected level encountered descending the tree",
                    ));
                }
                Some(_) => {}
            }
            if header.is_leaf() {
                return Ok(guard);
            }
            if key >= header.high_key {
                next = header
                    .next
                    .ok_or(StrataError::Corruption("fell off the end of the tree"))?;
            } else {
                let internal = InternalPage::parse(guard.data())?;
                let idx = internal.position_for(key).ok_or(StrataError::Corruption(
                    "no downlink at or below the search key",
                ))?;
                next = internal.items[idx].child;
                expected_level = Some(header.level - 1);
            }
            drop(guard);
        }
    }

    /// Re-finds the parent entry pointing at `child`, whose low key and
    /// level the caller supplies. Returns the parent exclusively latched
    /// together with the entry's index, or `None` when `child` is the
    /// root. The caller is expected to hold the child's latch.
    pub(crate) fn find_downlink(
        &self,
        key: Rid,
        child: PageId,
        child_level: u16,
    ) -> Result<Option<(PageWriteGuard, usize)>> {
        let root = self
            .root()?
            .ok_or(StrataError::Corruption("tree lost its root mid-split"))?;
        if root == child {
            return Ok(None);
        }
        let mut next = root;
        let mut expected_level: Option<u16> = None;
        loop {
            let guard = self.store.lock_exclusive(next)?;
            let header = PageHeader::parse(guard.data())?;
            match expected_level {
                None => expected_level = Some(header.level),
                Some(expected) if header.level != expected => {
                    return Err(StrataError::Corruption(
                        "unexpected level encountered descending the tree",
                    ));
                }
                Some(_) => {}
            }
            if header.level <= child_level {
                return Err(StrataError::Corruption(
                    "downlink search descended past the parent level",
                ));
            }
            if key >= header.high_key {
                next = header
                    .next
                    .ok_or(StrataError::Corruption("fell off the end of the tree"))?;
            } else {
                let internal = InternalPage::parse(guard.data())?;
                let idx = internal.position_for(key).ok_or(StrataError::Corruption(
                    "no downlink at or below the search key",
                ))?;
                if header.level == child_level + 1 {
                    if internal.items[idx].child != child {
                        return Err(StrataError::Corruption(
                            "could not re-find downlink for split child",
                        ));
                    }
                    return Ok(Some((guard, idx)));
                }
                next = internal.items[idx].child;
                expected_level = Some(header.level - 1);
            }
            drop(guard);
        }
    }
}
