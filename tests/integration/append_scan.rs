//! End-to-end usage of a two-attribute table: synchronized inserts and
//! scans, deletion marking, and snapshot visibility.

use std::sync::Arc;

use strata::mvcc::{CommitDeleter, RowHeader, Snapshot, SnapshotVisibility};
use strata::store::{MemDirectory, MemStore, PageStore, RootDirectory};
use strata::tree::{ColumnTree, TreeOptions};
use strata::types::{AttrNumber, Result, Rid};

const ORACLE: SnapshotVisibility = SnapshotVisibility;

struct Table {
    id_tree: ColumnTree,
    name_tree: ColumnTree,
}

impl Table {
    fn open(store: Arc<MemStore>, directory: Arc<MemDirectory>) -> Self {
        let id_tree = ColumnTree::new(
            Arc::clone(&store) as Arc<dyn PageStore>,
            Arc::clone(&directory) as Arc<dyn RootDirectory>,
            AttrNumber::FIRST,
            TreeOptions::default(),
        );
        let name_tree = ColumnTree::new(
            store as Arc<dyn PageStore>,
            directory as Arc<dyn RootDirectory>,
            AttrNumber(2),
            TreeOptions::default(),
        );
        Self { id_tree, name_tree }
    }

    fn insert(&self, commit: u64, id: u32, name: &str) -> Result<Rid> {
        let rid = self
            .id_tree
            .insert(&id.to_be_bytes(), Some(&RowHeader::inserted_at(commit)))?;
        let rid2 = self.name_tree.insert(name.as_bytes(), None)?;
        assert_eq!(rid, rid2, "attribute trees must stay in step");
        Ok(rid)
    }
}

#[test]
fn rows_come_back_in_insertion_order() -> Result<()> {
    let store = Arc::new(MemStore::new(256));
    let directory = Arc::new(MemDirectory::new());
    let table = Table::open(store, directory);

    let names = ["ada", "grace", "edsger", "barbara", "donald"];
    for (idx, name) in names.iter().enumerate() {
        table.insert(1, idx as u32, name)?;
    }

    let snapshot = Snapshot::at(10);
    let mut ids = table.id_tree.begin_scan(Rid::MIN_KEY, snapshot, &ORACLE)?;
    let mut labels = table.name_tree.begin_scan(Rid::MIN_KEY, snapshot, &ORACLE)?;
    for (idx, name) in names.iter().enumerate() {
        let id_item = ids.next()?.expect("id column has a row");
        let name_item = labels.next()?.expect("name column has a row");
        assert_eq!(id_item.rid, name_item.rid);
        assert_eq!(id_item.value, (idx as u32).to_be_bytes());
        assert_eq!(name_item.value, name.as_bytes());
        assert!(id_item.visible);
    }
    assert!(ids.next()?.is_none());
    assert!(labels.next()?.is_none());
    Ok(())
}

#[test]
fn deleted_rows_become_invisible_to_later_snapshots() -> Result<()> {
    let store = Arc::new(MemStore::new(512));
    let directory = Arc::new(MemDirectory::new());
    let table = Table::open(store, directory);

    let keep = table.insert(1, 100, "keep")?;
    let gone = table.insert(1, 200, "gone")?;

    assert!(table.id_tree.delete(gone, &CommitDeleter::at(5))?);

    // Before the deleting commit both rows are visible.
    let mut early = table.id_tree.begin_scan(Rid::MIN_KEY, Snapshot::at(4), &ORACLE)?;
    assert!(early.next()?.expect("row").visible);
    assert!(early.next()?.expect("row").visible);

    // At and after it, only the surviving row is.
    let mut late = table.id_tree.begin_scan(Rid::MIN_KEY, Snapshot::at(5), &ORACLE)?;
    let first = late.next()?.expect("row");
    assert_eq!(first.rid, keep);
    assert!(first.visible);
    let second = late.next()?.expect("row");
    assert_eq!(second.rid, gone);
    assert!(!second.visible);
    Ok(())
}

#[test]
fn scans_opened_before_more_inserts_pick_up_the_tail() -> Result<()> {
    let store = Arc::new(MemStore::new(256));
    let directory = Arc::new(MemDirectory::new());
    let table = Table::open(store, directory);

    table.insert(1, 1, "one")?;
    let mut scan = table
        .name_tree
        .begin_scan(Rid::MIN_KEY, Snapshot::at(9), &ORACLE)?;
    assert_eq!(scan.next()?.expect("row").value, b"one");

    // The cursor holds no latch between calls, so appends land while it
    // is paused and are seen when it resumes.
    table.insert(2, 2, "two")?;
    assert_eq!(scan.next()?.expect("row").value, b"two");
    assert!(scan.next()?.is_none());
    Ok(())
}
