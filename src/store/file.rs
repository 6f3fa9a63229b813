use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{Frame, FrameHandle, PageReadGuard, PageStore, PageWriteGuard};
use crate::types::{PageId, Result, StrataError};

/// Length of the per-page checksum prefix in the file.
const CHECKSUM_LEN: usize = 4;

/// Configuration for a [`FileStore`].
#[derive(Clone, Debug)]
pub struct FileStoreOptions {
    /// Page capacity in bytes. Must match the value the file was created
    /// with when opening an existing store.
    pub page_size: usize,
    /// Whether [`FileStore::flush`] issues fsync after writing.
    pub sync_on_flush: bool,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            page_size: 8192,
            sync_on_flush: true,
        }
    }
}

impl FileStoreOptions {
    /// Sets the page capacity.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Enables or disables fsync on flush.
    pub fn sync_on_flush(mut self, enabled: bool) -> Self {
        self.sync_on_flush = enabled;
        self
    }
}

/// Page store backed by a single file.
///
/// Pages live at `id * (4 + page_size)`; each record is a CRC32 of the page
/// image followed by the image itself. Checksums are computed on flush and
/// verified on load. Every page touched since open stays cached, so
/// un-flushed allocations are always served from memory.
pub struct FileStore {
    options: FileStoreOptions,
    file: Mutex<File>,
    frames: RwLock<HashMap<PageId, FrameHandle>>,
    page_count: AtomicU64,
}

impl FileStore {
    /// Creates a new store file. Fails if `path` already exists.
    pub fn create<P: AsRef<Path>>(path: P, options: FileStoreOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            options,
            file: Mutex::new(file),
            frames: RwLock::new(HashMap::new()),
            page_count: AtomicU64::new(0),
        })
    }

    /// Opens an existing store file.
    pub fn open<P: AsRef<Path>>(path: P, options: FileStoreOptions) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let record_len = (CHECKSUM_LEN + options.page_size) as u64;
        if len % record_len != 0 {
            return Err(StrataError::Corruption(
                "store file length is not a whole number of page records",
            ));
        }
        let page_count = len / record_len;
        Ok(Self {
            options,
            file: Mutex::new(file),
            frames: RwLock::new(HashMap::new()),
            page_count: AtomicU64::new(page_count),
        })
    }

    /// Opens `path`, creating it first if it does not exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P, options: FileStoreOptions) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, options)
        } else {
            Self::create(path, options)
        }
    }

    /// Writes every dirty page record and clears the dirty marks.
    pub fn flush(&self) -> Result<()> {
        let frames = self.frames.read();
        let mut ids: Vec<PageId> = frames.keys().copied().collect();
        ids.sort();
        let mut file = self.file.lock();
        let mut flushed = 0usize;
        for id in ids {
            let handle = frames.get(&id).expect("id collected from this map");
            let mut frame = handle.write();
            if !frame.dirty {
                continue;
            }
            let crc = crc32fast::hash(&frame.data);
            file.seek(SeekFrom::Start(self.record_offset(id)))?;
            file.write_all(&crc.to_be_bytes())?;
            file.write_all(&frame.data)?;
            frame.dirty = false;
            flushed += 1;
        }
        if self.options.sync_on_flush {
            file.sync_all()?;
        }
        debug!(target: "strata::store", pages = flushed, "flushed dirty pages");
        Ok(())
    }

    fn record_offset(&self, id: PageId) -> u64 {
        id.0 * (CHECKSUM_LEN + self.options.page_size) as u64
    }

    fn frame(&self, id: PageId) -> Result<FrameHandle> {
        if id.0 >= self.page_count.load(AtomicOrdering::SeqCst) {
            return Err(StrataError::Invalid("page id beyond allocated range"));
        }
        if let Some(handle) = self.frames.read().get(&id) {
            return Ok(handle.clone());
        }
        let mut frames = self.frames.write();
        if let Some(handle) = frames.get(&id) {
            return Ok(handle.clone());
        }
        let frame = self.load_record(id)?;
        let handle = Arc::new(RwLock::new(frame));
        frames.insert(id, handle.clone());
        Ok(handle)
    }

    fn load_record(&self, id: PageId) -> Result<Frame> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.record_offset(id)))?;
        let mut crc_buf = [0u8; CHECKSUM_LEN];
        file.read_exact(&mut crc_buf)?;
        let mut data = vec![0u8; self.options.page_size].into_boxed_slice();
        file.read_exact(&mut data)?;
        let expected = u32::from_be_bytes(crc_buf);
        if crc32fast::hash(&data) != expected {
            return Err(StrataError::Corruption("page checksum mismatch"));
        }
        Ok(Frame::from_image(data))
    }
}

impl PageStore for FileStore {
    fn page_size(&self) -> usize {
        self.options.page_size
    }

    fn page_count(&self) -> u64 {
        self.page_count.load(AtomicOrdering::SeqCst)
    }

    fn allocate(&self) -> Result<PageId> {
        let mut frames = self.frames.write();
        let id = PageId(self.page_count.fetch_add(1, AtomicOrdering::SeqCst));
        let mut frame = Frame::zeroed(self.options.page_size);
        // A fresh page exists only in memory until flushed.
        frame.dirty = true;
        frames.insert(id, Arc::new(RwLock::new(frame)));
        Ok(id)
    }

    fn lock_shared(&self, id: PageId) -> Result<PageReadGuard> {
        Ok(PageReadGuard::new(id, &self.frame(id)?))
    }

    fn lock_exclusive(&self, id: PageId) -> Result<PageWriteGuard> {
        Ok(PageWriteGuard::new(id, &self.frame(id)?))
    }
}
