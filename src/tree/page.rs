//! On-page layout for tree pages.
//!
//! Every page image starts with a fixed [`HEADER_LEN`]-byte header. Leaf
//! pages (level 0) carry a sequence of variable-length items, each either a
//! plain row or a compressed run; internal pages carry a packed array of
//! fixed-width downlinks. Page images are always rewritten wholesale: a
//! full replacement image is built and swapped in, never patched.

use smallvec::SmallVec;

use crate::types::{PageId, Result, Rid, StrataError, RID_LEN};

/// Total bytes of the page header.
pub const HEADER_LEN: usize = 32;

/// Identifies an initialized tree page.
const PAGE_MAGIC: u16 = 0x5354;

const MAGIC_OFFSET: usize = 0;
const LEVEL_OFFSET: usize = 2;
const STATE_OFFSET: usize = 4;
const NEXT_OFFSET: usize = 8;
const LOW_KEY_OFFSET: usize = 16;
const HIGH_KEY_OFFSET: usize = 22;
const ITEM_COUNT_OFFSET: usize = 28;

/// Sentinel page number meaning "no page".
const NO_PAGE: u64 = u64::MAX;

/// Bytes of overhead preceding a leaf item's payload (flags, rid, length).
pub const ITEM_HEADER_LEN: usize = 2 + RID_LEN + 2;

/// Encoded size of one internal downlink entry.
pub const DOWNLINK_LEN: usize = RID_LEN + 8;

/// Leaf item flags.
pub mod item_flags {
    /// Item payload is a compressed run of rows.
    pub const COMPRESSED: u16 = 0x0001;
}

/// Two-phase split state of a page.
///
/// A page is `SplitPending` from the moment a split carves off its right
/// sibling until the sibling's downlink lands in the parent. Traversals
/// that see a key at or above the page's high key reroute through `next`
/// instead of waiting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SplitState {
    /// No split in flight.
    Committed,
    /// Right sibling exists but is not yet linked into the parent.
    SplitPending,
}

impl SplitState {
    fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::Committed),
            1 => Ok(Self::SplitPending),
            _ => Err(StrataError::Corruption("unknown page split state")),
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            Self::Committed => 0,
            Self::SplitPending => 1,
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug)]
pub struct PageHeader {
    /// Distance from the leaf level; 0 is a leaf.
    pub level: u16,
    /// Two-phase split state.
    pub state: SplitState,
    /// Right sibling, if any.
    pub next: Option<PageId>,
    /// Inclusive lower bound of keys reachable through this page.
    pub low_key: Rid,
    /// Exclusive upper bound of keys reachable through this page.
    pub high_key: Rid,
    /// Number of items on the page.
    pub item_count: u16,
}

impl PageHeader {
    /// Decodes and validates the header at the front of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(StrataError::Corruption("page shorter than header"));
        }
        if read_u16(data, MAGIC_OFFSET) != PAGE_MAGIC {
            return Err(StrataError::Corruption("not an initialized tree page"));
        }
        let level = read_u16(data, LEVEL_OFFSET);
        let state = SplitState::from_u16(read_u16(data, STATE_OFFSET))?;
        let next = decode_page_id(&data[NEXT_OFFSET..NEXT_OFFSET + 8]);
        let low_key = Rid::decode(&data[LOW_KEY_OFFSET..])?;
        let high_key = Rid::decode(&data[HIGH_KEY_OFFSET..])?;
        let item_count = read_u16(data, ITEM_COUNT_OFFSET);
        if low_key >= high_key {
            return Err(StrataError::Corruption("page key bounds inverted"));
        }
        Ok(Self {
            level,
            state,
            next,
            low_key,
            high_key,
            item_count,
        })
    }

    /// Writes the header into the front of `data`.
    pub fn write_to(&self, data: &mut [u8]) {
        data[..HEADER_LEN].fill(0);
        write_u16(data, MAGIC_OFFSET, PAGE_MAGIC);
        write_u16(data, LEVEL_OFFSET, self.level);
        write_u16(data, STATE_OFFSET, self.state.as_u16());
        encode_page_id(&mut data[NEXT_OFFSET..NEXT_OFFSET + 8], self.next);
        self.low_key.write_to(&mut data[LOW_KEY_OFFSET..LOW_KEY_OFFSET + RID_LEN]);
        self.high_key
            .write_to(&mut data[HIGH_KEY_OFFSET..HIGH_KEY_OFFSET + RID_LEN]);
        write_u16(data, ITEM_COUNT_OFFSET, self.item_count);
    }

    /// Returns `true` for level-0 pages.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// An uncompressed leaf item: one row of one attribute.
///
/// For the first attribute the payload starts with the encoded row header;
/// for every other attribute it is the raw value bytes alone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlainItem {
    /// Row id of the item.
    pub rid: Rid,
    /// Item flags; the [`item_flags::COMPRESSED`] bit is reserved.
    pub flags: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// A compressed run of consecutive rows.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompressedItem {
    /// Row id of the first row in the run.
    pub first: Rid,
    /// Row id of the last row in the run.
    pub last: Rid,
    /// Opaque codec output; decodes to a run of plain items.
    pub payload: Vec<u8>,
}

/// One entry of a leaf page's item list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LeafItem {
    /// A single uncompressed row.
    Plain(PlainItem),
    /// A compressed run of rows.
    Compressed(CompressedItem),
}

impl LeafItem {
    /// First row id covered by the item.
    pub fn first_rid(&self) -> Rid {
        match self {
            Self::Plain(item) => item.rid,
            Self::Compressed(item) => item.first,
        }
    }

    /// Last row id covered by the item.
    pub fn last_rid(&self) -> Rid {
        match self {
            Self::Plain(item) => item.rid,
            Self::Compressed(item) => item.last,
        }
    }

    /// Encoded size of the item in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Plain(item) => ITEM_HEADER_LEN + item.payload.len(),
            Self::Compressed(item) => ITEM_HEADER_LEN + RID_LEN + item.payload.len(),
        }
    }

    /// Appends the encoded item to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Plain(item) => {
                if item.flags & item_flags::COMPRESSED != 0 {
                    return Err(StrataError::Invalid(
                        "compressed flag is reserved on plain items",
                    ));
                }
                let len = payload_len_u16(&item.payload)?;
                out.extend_from_slice(&item.flags.to_be_bytes());
                item.rid.encode_into(out);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&item.payload);
            }
            Self::Compressed(item) => {
                let len = payload_len_u16(&item.payload)?;
                out.extend_from_slice(&item_flags::COMPRESSED.to_be_bytes());
                item.first.encode_into(out);
                out.extend_from_slice(&len.to_be_bytes());
                item.last.encode_into(out);
                out.extend_from_slice(&item.payload);
            }
        }
        Ok(())
    }

    /// Decodes one item from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < ITEM_HEADER_LEN {
            return Err(StrataError::Corruption("leaf item header truncated"));
        }
        let flags = read_u16(buf, 0);
        let rid = Rid::decode(&buf[2..])?;
        let len = read_u16(buf, 2 + RID_LEN) as usize;
        if flags & item_flags::COMPRESSED != 0 {
            let end = ITEM_HEADER_LEN + RID_LEN + len;
            if buf.len() < end {
                return Err(StrataError::Corruption("compressed item truncated"));
            }
            let last = Rid::decode(&buf[ITEM_HEADER_LEN..])?;
            if last < rid {
                return Err(StrataError::Corruption("compressed run bounds inverted"));
            }
            let payload = buf[ITEM_HEADER_LEN + RID_LEN..end].to_vec();
            Ok((
                Self::Compressed(CompressedItem {
                    first: rid,
                    last,
                    payload,
                }),
                end,
            ))
        } else {
            let end = ITEM_HEADER_LEN + len;
            if buf.len() < end {
                return Err(StrataError::Corruption("leaf item truncated"));
            }
            let payload = buf[ITEM_HEADER_LEN..end].to_vec();
            Ok((Self::Plain(PlainItem { rid, flags, payload }), end))
        }
    }
}

/// Decoded image of a leaf page.
#[derive(Clone, Debug)]
pub struct LeafPage {
    /// Page header; `level` is always 0.
    pub header: PageHeader,
    /// Items ordered strictly by row id.
    pub items: Vec<LeafItem>,
}

impl LeafPage {
    /// An empty leaf spanning `[low_key, high_key)`.
    pub fn empty(low_key: Rid, high_key: Rid) -> Self {
        Self {
            header: PageHeader {
                level: 0,
                state: SplitState::Committed,
                next: None,
                low_key,
                high_key,
                item_count: 0,
            },
            items: Vec::new(),
        }
    }

    /// Decodes a leaf page, validating item order and span disjointness.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = PageHeader::parse(data)?;
        if !header.is_leaf() {
            return Err(StrataError::Corruption("expected a leaf page"));
        }
        let mut items = Vec::with_capacity(header.item_count as usize);
        let mut offset = HEADER_LEN;
        let mut prev_last: Option<Rid> = None;
        for _ in 0..header.item_count {
            let (item, consumed) = LeafItem::decode(&data[offset..])?;
            if let Some(prev) = prev_last {
                if item.first_rid() <= prev {
                    return Err(StrataError::Corruption("leaf items out of order"));
                }
            }
            prev_last = Some(item.last_rid());
            offset += consumed;
            items.push(item);
        }
        Ok(Self { header, items })
    }

    /// Encoded size of the full page image.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self
                .items
                .iter()
                .map(LeafItem::encoded_len)
                .sum::<usize>()
    }

    /// Returns `true` if an additional `extra` bytes of item would still
    /// fit within `page_size`.
    pub fn fits(&self, extra: usize, page_size: usize) -> bool {
        self.encoded_len() + extra <= page_size
    }

    /// Builds the page image into `data`, zero-filling the tail.
    ///
    /// Overflow here is a fatal error: callers verify capacity before
    /// rewriting.
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        if self.items.len() > u16::MAX as usize {
            return Err(StrataError::Corruption("leaf item count exceeds u16"));
        }
        let mut body = Vec::with_capacity(self.encoded_len() - HEADER_LEN);
        for item in &self.items {
            item.encode_into(&mut body)?;
        }
        if HEADER_LEN + body.len() > data.len() {
            return Err(StrataError::Corruption(
                "leaf image exceeds page capacity after fit check",
            ));
        }
        let mut header = self.header.clone();
        header.level = 0;
        header.item_count = self.items.len() as u16;
        header.write_to(data);
        data[HEADER_LEN..HEADER_LEN + body.len()].copy_from_slice(&body);
        data[HEADER_LEN + body.len()..].fill(0);
        Ok(())
    }
}

/// One internal-page entry routing descent into a subtree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Downlink {
    /// Low key of the subtree under `child`.
    pub key: Rid,
    /// Page id of the subtree root.
    pub child: PageId,
}

/// Decoded image of an internal page.
#[derive(Clone, Debug)]
pub struct InternalPage {
    /// Page header; `level` is always at least 1.
    pub header: PageHeader,
    /// Downlinks ordered strictly by key; entry 0's key equals the page's
    /// low key.
    pub items: SmallVec<[Downlink; 8]>,
}

impl InternalPage {
    /// Decodes an internal page, validating downlink order.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = PageHeader::parse(data)?;
        if header.is_leaf() {
            return Err(StrataError::Corruption("expected an internal page"));
        }
        let count = header.item_count as usize;
        if HEADER_LEN + count * DOWNLINK_LEN > data.len() {
            return Err(StrataError::Corruption("downlink array exceeds page"));
        }
        let mut items = SmallVec::with_capacity(count);
        let mut prev: Option<Rid> = None;
        for idx in 0..count {
            let offset = HEADER_LEN + idx * DOWNLINK_LEN;
            let key = Rid::decode(&data[offset..])?;
            let child = PageId(u64::from_be_bytes(
                data[offset + RID_LEN..offset + DOWNLINK_LEN]
                    .try_into()
                    .expect("sliced to 8 bytes"),
            ));
            if let Some(prev_key) = prev {
                if key <= prev_key {
                    return Err(StrataError::Corruption("downlink keys out of order"));
                }
            }
            prev = Some(key);
            items.push(Downlink { key, child });
        }
        Ok(Self { header, items })
    }

    /// Encoded size of the full page image.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.items.len() * DOWNLINK_LEN
    }

    /// Returns `true` when no further downlink fits within `page_size`.
    pub fn is_full(&self, page_size: usize) -> bool {
        self.encoded_len() + DOWNLINK_LEN > page_size
    }

    /// Builds the page image into `data`, zero-filling the tail.
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        if self.items.len() > u16::MAX as usize {
            return Err(StrataError::Corruption("downlink count exceeds u16"));
        }
        if self.encoded_len() > data.len() {
            return Err(StrataError::Corruption(
                "internal image exceeds page capacity after fit check",
            ));
        }
        let mut header = self.header.clone();
        header.item_count = self.items.len() as u16;
        header.write_to(data);
        for (idx, link) in self.items.iter().enumerate() {
            let offset = HEADER_LEN + idx * DOWNLINK_LEN;
            link.key.write_to(&mut data[offset..offset + RID_LEN]);
            data[offset + RID_LEN..offset + DOWNLINK_LEN]
                .copy_from_slice(&link.child.0.to_be_bytes());
        }
        data[self.encoded_len()..].fill(0);
        Ok(())
    }

    /// Lower-bound search: index of the rightmost downlink whose key is at
    /// most `key`, or `None` when every key is greater (or the page is
    /// empty). Entry 0's key equals the page's low key, so `None` against
    /// a key within the page's bounds indicates corruption.
    pub fn position_for(&self, key: Rid) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.items.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if key >= self.items[mid].key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }
}

fn payload_len_u16(payload: &[u8]) -> Result<u16> {
    u16::try_from(payload.len()).map_err(|_| StrataError::Invalid("item payload exceeds u16"))
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(data[offset..offset + 2].try_into().expect("sliced to 2 bytes"))
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn decode_page_id(bytes: &[u8]) -> Option<PageId> {
    let raw = u64::from_be_bytes(bytes.try_into().expect("sliced to 8 bytes"));
    if raw == NO_PAGE {
        None
    } else {
        Some(PageId(raw))
    }
}

fn encode_page_id(bytes: &mut [u8], value: Option<PageId>) {
    let raw = value.map(|p| p.0).unwrap_or(NO_PAGE);
    bytes.copy_from_slice(&raw.to_be_bytes());
}
