//! Trees built on the file-backed store survive a flush and reopen.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use strata::mvcc::{Snapshot, SnapshotVisibility};
use strata::store::{FileStore, FileStoreOptions, MemDirectory, PageStore, RootDirectory};
use strata::tree::{ColumnTree, TreeOptions};
use strata::types::{AttrNumber, PageId, Result, Rid, StrataError};

const ORACLE: SnapshotVisibility = SnapshotVisibility;

fn tree_on(store: Arc<FileStore>, directory: Arc<MemDirectory>) -> ColumnTree {
    ColumnTree::new(
        store as Arc<dyn PageStore>,
        directory as Arc<dyn RootDirectory>,
        AttrNumber(2),
        TreeOptions::default(),
    )
}

#[test]
fn rows_survive_flush_and_reopen() -> Result<()> {
    let dir = tempdir().map_err(StrataError::Io)?;
    let path = dir.path().join("column.db");
    let options = FileStoreOptions::default().page_size(160);

    let mut expected = Vec::new();
    let root: PageId;
    {
        let store = Arc::new(FileStore::create(&path, options.clone())?);
        let directory = Arc::new(MemDirectory::new());
        let tree = tree_on(Arc::clone(&store), Arc::clone(&directory));
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..50 {
            let mut value = vec![0u8; 16];
            rng.fill(value.as_mut_slice());
            let rid = tree.insert(&value, None)?;
            expected.push((rid, value));
        }
        assert!(tree.stats().leaf_splits >= 1);
        store.flush()?;
        root = directory
            .get_root(AttrNumber(2))?
            .expect("tree has a root");
    }

    // Reopen the file; the root pointer comes from the (external)
    // directory service, re-registered here.
    let store = Arc::new(FileStore::open(&path, options)?);
    let directory = Arc::new(MemDirectory::new());
    directory.set_root(AttrNumber(2), root)?;
    let tree = tree_on(store, directory);

    let mut scan = tree.begin_scan(Rid::MIN_KEY, Snapshot::at(1), &ORACLE)?;
    let mut seen = 0usize;
    while let Some(item) = scan.next()? {
        let (rid, value) = &expected[seen];
        assert_eq!(item.rid, *rid);
        assert_eq!(&item.value, value);
        seen += 1;
    }
    assert_eq!(seen, expected.len());

    // And the reopened tree keeps appending where it left off.
    let next = tree.next_rid()?;
    assert_eq!(next, expected.last().expect("rows inserted").0.next());
    Ok(())
}
