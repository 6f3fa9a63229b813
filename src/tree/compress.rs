//! Leaf repack pass: merge runs of plain items into compressed chunks.

use tracing::trace;

use crate::store::PageWriteGuard;
use crate::types::Result;

use super::codec::BatchCompressor;
use super::page::{LeafItem, LeafPage, HEADER_LEN};

/// Replacement item list under construction, tracking encoded size so the
/// pass can abort before touching the original page.
struct LeafRebuild {
    items: Vec<LeafItem>,
    used: usize,
    capacity: usize,
}

impl LeafRebuild {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            used: HEADER_LEN,
            capacity,
        }
    }

    /// Appends `item` if it fits the page; `false` aborts the pass.
    fn push(&mut self, item: LeafItem) -> bool {
        let len = item.encoded_len();
        if self.used + len > self.capacity {
            return false;
        }
        self.used += len;
        self.items.push(item);
        true
    }

    fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

/// Rewrites the leaf under `guard`, compressing consecutive plain items.
///
/// Already-compressed items pass through unchanged; an open batch is
/// force-flushed when one is encountered, and compressed runs are never
/// merged with each other. The rewrite is all-or-nothing: when the
/// replacement image would overflow the page, the original is left
/// untouched and the pass reports `false`.
pub(crate) fn compress_leaf(guard: &mut PageWriteGuard) -> Result<bool> {
    let page_size = guard.data().len();
    let leaf = LeafPage::parse(guard.data())?;

    let mut rebuild = LeafRebuild::new(page_size);
    let mut compressor = BatchCompressor::new();
    let mut open = false;

    for item in &leaf.items {
        match item {
            LeafItem::Compressed(_) => {
                if open && !compressor.is_empty() {
                    if !rebuild.push(LeafItem::Compressed(compressor.finish()?)) {
                        return Ok(false);
                    }
                }
                open = false;
                if !rebuild.push(item.clone()) {
                    return Ok(false);
                }
            }
            LeafItem::Plain(plain) => loop {
                if !open {
                    compressor.begin(rebuild.remaining());
                    open = true;
                }
                if compressor.add(plain) {
                    break;
                }
                if compressor.is_empty() {
                    // Not worth compressing even on its own; keep as-is.
                    open = false;
                    if !rebuild.push(LeafItem::Plain(plain.clone())) {
                        return Ok(false);
                    }
                    break;
                }
                let flushed = compressor.finish()?;
                open = false;
                if !rebuild.push(LeafItem::Compressed(flushed)) {
                    return Ok(false);
                }
                // Loop around and retry the rejected item in a fresh batch.
            },
        }
    }
    if open && !compressor.is_empty() {
        if !rebuild.push(LeafItem::Compressed(compressor.finish()?)) {
            return Ok(false);
        }
    }

    let replacement = LeafPage {
        header: leaf.header.clone(),
        items: rebuild.items,
    };
    replacement.write_to(guard.data_mut())?;
    guard.mark_dirty();
    trace!(
        target: "strata::compress",
        page = guard.id().0,
        before = leaf.items.len(),
        after = replacement.items.len(),
        "repacked leaf"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, PageStore};
    use crate::types::{Rid, StrataError};

    use super::super::codec::DecompressIter;
    use super::super::page::{CompressedItem, PlainItem};

    fn plain(minor: u16, payload: &[u8]) -> LeafItem {
        LeafItem::Plain(PlainItem {
            rid: Rid::new(0, minor),
            flags: 0,
            payload: payload.to_vec(),
        })
    }

    fn write_leaf(store: &MemStore, items: Vec<LeafItem>) -> Result<crate::types::PageId> {
        let id = store.allocate()?;
        let mut page = LeafPage::empty(Rid::MIN_KEY, Rid::MAX_KEY);
        page.items = items;
        let mut guard = store.lock_exclusive(id)?;
        page.write_to(guard.data_mut())?;
        guard.mark_dirty();
        Ok(id)
    }

    #[test]
    fn plain_run_becomes_one_compressed_item() -> Result<()> {
        let store = MemStore::new(4096);
        let items: Vec<LeafItem> = (1..=20).map(|m| plain(m, &[0x11u8; 40])).collect();
        let id = write_leaf(&store, items)?;

        let mut guard = store.lock_exclusive(id)?;
        assert!(compress_leaf(&mut guard)?);
        let leaf = LeafPage::parse(guard.data())?;
        assert_eq!(leaf.items.len(), 1);
        let LeafItem::Compressed(run) = &leaf.items[0] else {
            panic!("expected a compressed run");
        };
        assert_eq!(run.first, Rid::new(0, 1));
        assert_eq!(run.last, Rid::new(0, 20));

        // Every row survives with its payload intact.
        let mut reader = DecompressIter::open(run)?;
        for minor in 1..=20u16 {
            let item = reader.next_item()?.expect("run has more rows");
            assert_eq!(item.rid, Rid::new(0, minor));
            assert_eq!(item.payload, vec![0x11u8; 40]);
        }
        assert!(reader.next_item()?.is_none());
        Ok(())
    }

    #[test]
    fn existing_runs_pass_through_and_split_batches() -> Result<()> {
        let store = MemStore::new(4096);
        let run = CompressedItem {
            first: Rid::new(0, 5),
            last: Rid::new(0, 6),
            payload: snap::raw::Encoder::new()
                .compress_vec(b"")
                .map_err(|e| StrataError::Codec(e.to_string()))?,
        };
        let items = vec![
            plain(1, &[0x22u8; 30]),
            plain(2, &[0x22u8; 30]),
            LeafItem::Compressed(run.clone()),
            plain(7, &[0x33u8; 30]),
            plain(8, &[0x33u8; 30]),
        ];
        let id = write_leaf(&store, items)?;

        let mut guard = store.lock_exclusive(id)?;
        assert!(compress_leaf(&mut guard)?);
        let leaf = LeafPage::parse(guard.data())?;
        // Batch before the run, the run unchanged, batch after the run.
        assert_eq!(leaf.items.len(), 3);
        assert_eq!(leaf.items[0].first_rid(), Rid::new(0, 1));
        assert_eq!(leaf.items[0].last_rid(), Rid::new(0, 2));
        assert_eq!(leaf.items[1], LeafItem::Compressed(run));
        assert_eq!(leaf.items[2].first_rid(), Rid::new(0, 7));
        assert_eq!(leaf.items[2].last_rid(), Rid::new(0, 8));
        Ok(())
    }

    #[test]
    fn order_is_preserved_across_repack() -> Result<()> {
        let store = MemStore::new(4096);
        let items: Vec<LeafItem> = (1..=30).map(|m| plain(m, &[m as u8; 25])).collect();
        let id = write_leaf(&store, items)?;
        let mut guard = store.lock_exclusive(id)?;
        assert!(compress_leaf(&mut guard)?);
        // Parse revalidates strict item order and span disjointness.
        let leaf = LeafPage::parse(guard.data())?;
        assert!(!leaf.items.is_empty());
        assert_eq!(leaf.items.first().expect("nonempty").first_rid(), Rid::new(0, 1));
        assert_eq!(leaf.items.last().expect("nonempty").last_rid(), Rid::new(0, 30));
        Ok(())
    }
}
