//! Batch compression codec for leaf items.
//!
//! A batch is the concatenation of plain-item encodings, compressed as one
//! Snappy block. The compressor is fed items in row-id order and reports
//! through [`BatchCompressor::add`] when an item does not fit the open
//! batch; the caller then flushes with [`BatchCompressor::finish`] and
//! retries. Decoding is lazy: [`DecompressIter`] yields one plain item at a
//! time from the decompressed block.

use crate::types::{Result, Rid, StrataError};

use super::page::{CompressedItem, LeafItem, PlainItem, ITEM_HEADER_LEN};

/// How far past the capacity hint the uncompressed batch may grow. The
/// final fit check on the rebuilt page remains authoritative.
const BATCH_GROWTH: usize = 2;

/// Accumulates consecutive plain items into one compressed run.
#[derive(Default)]
pub struct BatchCompressor {
    buf: Vec<u8>,
    first: Option<Rid>,
    last: Option<Rid>,
    count: usize,
    budget: usize,
}

impl BatchCompressor {
    /// Creates an idle compressor. Call [`begin`](Self::begin) before
    /// adding items.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new batch aimed at roughly `capacity_hint` bytes of
    /// compressed output.
    pub fn begin(&mut self, capacity_hint: usize) {
        self.buf.clear();
        self.first = None;
        self.last = None;
        self.count = 0;
        self.budget = capacity_hint.saturating_mul(BATCH_GROWTH);
    }

    /// Number of items in the open batch.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` when the open batch holds no items.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Tries to append `item` to the open batch. Returns `false` when the
    /// item does not fit: either the batch is at capacity, or (with an
    /// empty batch) the item is not worth compressing on its own.
    pub fn add(&mut self, item: &PlainItem) -> bool {
        if item.payload.len() > u16::MAX as usize {
            return false;
        }
        let encoded_len = ITEM_HEADER_LEN + item.payload.len();
        if self.buf.len() + encoded_len > self.budget {
            return false;
        }
        self.buf.extend_from_slice(&item.flags.to_be_bytes());
        item.rid.encode_into(&mut self.buf);
        self.buf
            .extend_from_slice(&(item.payload.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(&item.payload);
        if self.first.is_none() {
            self.first = Some(item.rid);
        }
        self.last = Some(item.rid);
        self.count += 1;
        true
    }

    /// Compresses the open batch into one item and resets the compressor.
    pub fn finish(&mut self) -> Result<CompressedItem> {
        let (Some(first), Some(last)) = (self.first, self.last) else {
            return Err(StrataError::Invalid("finishing an empty batch"));
        };
        let payload = snap::raw::Encoder::new()
            .compress_vec(&self.buf)
            .map_err(|err| StrataError::Codec(err.to_string()))?;
        self.begin(0);
        Ok(CompressedItem {
            first,
            last,
            payload,
        })
    }
}

/// Lazy reader over the rows of one compressed run.
pub struct DecompressIter {
    buf: Vec<u8>,
    offset: usize,
}

impl DecompressIter {
    /// Decompresses `item` and positions the reader at its first row.
    pub fn open(item: &CompressedItem) -> Result<Self> {
        let buf = snap::raw::Decoder::new()
            .decompress_vec(&item.payload)
            .map_err(|err| StrataError::Codec(err.to_string()))?;
        Ok(Self { buf, offset: 0 })
    }

    /// Yields the next plain item of the run, or `None` when exhausted.
    pub fn next_item(&mut self) -> Result<Option<PlainItem>> {
        if self.offset >= self.buf.len() {
            return Ok(None);
        }
        let (item, consumed) = LeafItem::decode(&self.buf[self.offset..])?;
        self.offset += consumed;
        match item {
            LeafItem::Plain(plain) => Ok(Some(plain)),
            LeafItem::Compressed(_) => {
                Err(StrataError::Corruption("nested compressed run"))
            }
        }
    }
}
