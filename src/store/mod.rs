//! Page stores: fixed-size page images with per-page latches.
//!
//! The tree core only sees the [`PageStore`] trait: allocate a page, take a
//! shared or exclusive latch on it, and mark it dirty through the returned
//! guard. Two implementations are provided, an in-memory store for
//! ephemeral trees and tests, and a single-file store with CRC32-checked
//! page records.

use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::types::{PageId, Result};

mod directory;
mod file;
mod mem;

pub use directory::{MemDirectory, RootDirectory};
pub use file::{FileStore, FileStoreOptions};
pub use mem::MemStore;

/// A cached page image plus its dirty marker.
pub struct Frame {
    data: Box<[u8]>,
    dirty: bool,
}

impl Frame {
    fn zeroed(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
            dirty: false,
        }
    }

    fn from_image(data: Box<[u8]>) -> Self {
        Self { data, dirty: false }
    }
}

type FrameHandle = Arc<RwLock<Frame>>;

/// Shared latch on one page. Held only while reading the page's items.
pub struct PageReadGuard {
    id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Frame>,
}

impl PageReadGuard {
    fn new(id: PageId, handle: &FrameHandle) -> Self {
        Self {
            id,
            guard: RwLock::read_arc(handle),
        }
    }

    /// The page this guard latches.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The page image.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }
}

impl std::fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Exclusive latch on one page.
pub struct PageWriteGuard {
    id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Frame>,
}

impl PageWriteGuard {
    fn new(id: PageId, handle: &FrameHandle) -> Self {
        Self {
            id,
            guard: RwLock::write_arc(handle),
        }
    }

    /// The page this guard latches.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The page image.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    /// Mutable access to the page image.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }

    /// Records that the image changed and must be persisted.
    pub fn mark_dirty(&mut self) {
        self.guard.dirty = true;
    }
}

/// Fixed-size page storage with per-page shared/exclusive latches.
///
/// Pages are allocated on demand and never deallocated. Latch acquisition
/// blocks; the engine's lock ordering (child before parent, left before
/// right) keeps acquisitions acyclic.
pub trait PageStore: Send + Sync {
    /// The store-wide page capacity in bytes.
    fn page_size(&self) -> usize;

    /// Number of pages allocated so far.
    fn page_count(&self) -> u64;

    /// Allocates a zeroed page and returns its id.
    fn allocate(&self) -> Result<PageId>;

    /// Takes a shared latch on `id`.
    fn lock_shared(&self, id: PageId) -> Result<PageReadGuard>;

    /// Takes an exclusive latch on `id`.
    fn lock_exclusive(&self, id: PageId) -> Result<PageWriteGuard>;
}
