//! Structural invariants under heavy splitting: tiny pages, hundreds of
//! appends, multi-level downlink propagation.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use strata::mvcc::{Snapshot, SnapshotVisibility};
use strata::store::{MemDirectory, MemStore, PageStore, RootDirectory};
use strata::tree::page::{LeafPage, PageHeader, SplitState};
use strata::tree::{ColumnTree, TreeOptions};
use strata::types::{AttrNumber, PageId, Result, Rid};

const ORACLE: SnapshotVisibility = SnapshotVisibility;
const PAGE_SIZE: usize = 128;

fn grown_tree(rows: usize, seed: u64) -> Result<(Arc<MemStore>, ColumnTree, Vec<(Rid, Vec<u8>)>)> {
    let store = Arc::new(MemStore::new(PAGE_SIZE));
    let directory = Arc::new(MemDirectory::new());
    let tree = ColumnTree::new(
        Arc::clone(&store) as Arc<dyn PageStore>,
        directory as Arc<dyn RootDirectory>,
        AttrNumber(2),
        TreeOptions::default(),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut expected = Vec::with_capacity(rows);
    for _ in 0..rows {
        let mut value = vec![0u8; 20];
        rng.fill(value.as_mut_slice());
        let rid = tree.insert(&value, None)?;
        expected.push((rid, value));
    }
    Ok((store, tree, expected))
}

#[test]
fn every_inserted_row_is_scanned_exactly_once() -> Result<()> {
    let (_, tree, expected) = grown_tree(300, 17)?;
    let stats = tree.stats();
    assert!(stats.leaf_splits > 10, "workload must split many leaves");
    assert!(stats.internal_splits >= 1, "workload must split internals");
    assert!(stats.new_roots >= 2, "workload must raise the tree twice");

    let mut scan = tree.begin_scan(Rid::MIN_KEY, Snapshot::at(1), &ORACLE)?;
    let mut seen = 0usize;
    while let Some(item) = scan.next()? {
        let (rid, value) = &expected[seen];
        assert_eq!(item.rid, *rid);
        assert_eq!(&item.value, value);
        seen += 1;
    }
    assert_eq!(seen, expected.len());
    Ok(())
}

#[test]
fn no_page_stays_split_pending_and_leaves_tile_the_key_space() -> Result<()> {
    let (store, tree, _) = grown_tree(300, 23)?;
    assert!(tree.stats().internal_splits >= 1);

    let mut leaves = Vec::new();
    for raw in 0..store.page_count() {
        let guard = store.lock_shared(PageId(raw))?;
        let header = PageHeader::parse(guard.data())?;
        assert_eq!(
            header.state,
            SplitState::Committed,
            "page {raw} left split-pending at rest"
        );
        if header.level == 0 {
            let leaf = LeafPage::parse(guard.data())?;
            leaves.push(leaf);
        }
    }

    leaves.sort_by_key(|leaf| leaf.header.low_key);
    assert_eq!(leaves.first().expect("leaves exist").header.low_key, Rid::MIN_KEY);
    assert_eq!(leaves.last().expect("leaves exist").header.high_key, Rid::MAX_KEY);
    for pair in leaves.windows(2) {
        assert_eq!(
            pair[0].header.high_key, pair[1].header.low_key,
            "adjacent leaf bounds must touch"
        );
    }
    // The sibling chain orders the same way the bounds do.
    for pair in leaves.windows(2) {
        let next = pair[0].header.next.expect("non-rightmost leaf has a sibling");
        let guard = store.lock_shared(next)?;
        let sibling = PageHeader::parse(guard.data())?;
        assert_eq!(sibling.low_key, pair[0].header.high_key);
    }

    // Items respect their page bounds and strictly increase globally.
    let mut prev: Option<Rid> = None;
    for leaf in &leaves {
        for item in &leaf.items {
            assert!(item.first_rid() >= leaf.header.low_key);
            assert!(item.last_rid() < leaf.header.high_key);
            if let Some(prev_rid) = prev {
                assert!(item.first_rid() > prev_rid);
            }
            prev = Some(item.last_rid());
        }
    }
    Ok(())
}

#[test]
fn point_scans_work_for_every_row_after_deep_splits() -> Result<()> {
    let (_, tree, expected) = grown_tree(250, 31)?;
    for (rid, value) in &expected {
        let mut scan = tree.begin_scan(*rid, Snapshot::at(1), &ORACLE)?;
        let item = scan.next()?.expect("row is reachable by point scan");
        assert_eq!(item.rid, *rid);
        assert_eq!(&item.value, value);
    }
    Ok(())
}
