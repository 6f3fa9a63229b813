use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::{AttrNumber, PageId, Result};

/// The per-attribute root-pointer directory.
///
/// Maps an attribute number to the page id of its current tree root. Root
/// creation runs the caller's initializer under the directory's own lock,
/// so registering the root and allocating its page observe a single
/// serialization point.
pub trait RootDirectory: Send + Sync {
    /// Returns the current root of `attno`, if the attribute has one.
    fn get_root(&self, attno: AttrNumber) -> Result<Option<PageId>>;

    /// Returns the current root of `attno`, running `init` to allocate and
    /// initialize one first if the attribute has none.
    fn get_or_create_root(
        &self,
        attno: AttrNumber,
        init: &mut dyn FnMut() -> Result<PageId>,
    ) -> Result<PageId>;

    /// Points `attno` at a new root page.
    fn set_root(&self, attno: AttrNumber, root: PageId) -> Result<()>;
}

/// In-memory root directory.
#[derive(Default)]
pub struct MemDirectory {
    roots: Mutex<HashMap<AttrNumber, PageId>>,
}

impl MemDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RootDirectory for MemDirectory {
    fn get_root(&self, attno: AttrNumber) -> Result<Option<PageId>> {
        Ok(self.roots.lock().get(&attno).copied())
    }

    fn get_or_create_root(
        &self,
        attno: AttrNumber,
        init: &mut dyn FnMut() -> Result<PageId>,
    ) -> Result<PageId> {
        let mut roots = self.roots.lock();
        if let Some(root) = roots.get(&attno) {
            return Ok(*root);
        }
        let root = init()?;
        roots.insert(attno, root);
        Ok(root)
    }

    fn set_root(&self, attno: AttrNumber, root: PageId) -> Result<()> {
        self.roots.lock().insert(attno, root);
        Ok(())
    }
}
