use parking_lot::RwLock;
use std::sync::Arc;

use super::{Frame, FrameHandle, PageReadGuard, PageStore, PageWriteGuard};
use crate::types::{PageId, Result, StrataError};

/// Page store that keeps every page in memory. Nothing is persisted.
pub struct MemStore {
    page_size: usize,
    frames: RwLock<Vec<FrameHandle>>,
}

impl MemStore {
    /// Creates an empty store with the given page capacity.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            frames: RwLock::new(Vec::new()),
        }
    }

    fn frame(&self, id: PageId) -> Result<FrameHandle> {
        let frames = self.frames.read();
        frames
            .get(id.0 as usize)
            .cloned()
            .ok_or(StrataError::Invalid("page id beyond allocated range"))
    }
}

impl PageStore for MemStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.frames.read().len() as u64
    }

    fn allocate(&self) -> Result<PageId> {
        let mut frames = self.frames.write();
        let id = PageId(frames.len() as u64);
        frames.push(Arc::new(RwLock::new(Frame::zeroed(self.page_size))));
        Ok(id)
    }

    fn lock_shared(&self, id: PageId) -> Result<PageReadGuard> {
        Ok(PageReadGuard::new(id, &self.frame(id)?))
    }

    fn lock_exclusive(&self, id: PageId) -> Result<PageWriteGuard> {
        Ok(PageWriteGuard::new(id, &self.frame(id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_hands_out_sequential_ids() -> Result<()> {
        let store = MemStore::new(256);
        assert_eq!(store.allocate()?, PageId(0));
        assert_eq!(store.allocate()?, PageId(1));
        assert_eq!(store.page_count(), 2);
        Ok(())
    }

    #[test]
    fn pages_start_zeroed_and_accept_writes() -> Result<()> {
        let store = MemStore::new(64);
        let id = store.allocate()?;
        {
            let mut page = store.lock_exclusive(id)?;
            assert!(page.data().iter().all(|&b| b == 0));
            page.data_mut()[0] = 0xAB;
            page.mark_dirty();
        }
        let page = store.lock_shared(id)?;
        assert_eq!(page.data()[0], 0xAB);
        Ok(())
    }

    #[test]
    fn unknown_page_is_rejected() {
        let store = MemStore::new(64);
        let err = store.lock_shared(PageId(9)).unwrap_err();
        assert!(matches!(err, StrataError::Invalid(_)));
    }
}
