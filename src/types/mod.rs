//! Core identifier types and the crate-wide error enum.

use std::fmt;
use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An impossible on-page or in-tree state was observed. Not retryable.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// A caller-supplied argument violates the API contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The named entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The operation is a documented gap, not an error in the data.
    #[error("not yet supported: {0}")]
    Unsupported(&'static str),
    /// The compression codec rejected its input or output.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Physical page number within a page store. Zero is a valid page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-based attribute (column) number. Attribute 1 carries the row headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AttrNumber(pub u16);

impl AttrNumber {
    /// The first attribute, which stores per-row MVCC bookkeeping.
    pub const FIRST: AttrNumber = AttrNumber(1);

    /// Returns `true` for the attribute that carries row headers.
    pub fn is_first(self) -> bool {
        self == Self::FIRST
    }
}

/// Encoded length of a [`Rid`] in bytes.
pub const RID_LEN: usize = 6;

const MAX_MINOR: u16 = 0xFFFE;

/// Logical row identifier: an ordered `(major, minor)` pair.
///
/// `minor` is one-based; `(x, 0)` never identifies a row. Ordering is
/// lexicographic, so row ids assigned by [`Rid::next`] are strictly
/// increasing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Rid {
    /// Coarse component (block-like position).
    pub major: u32,
    /// Fine component within a major unit. One-based.
    pub minor: u16,
}

impl Rid {
    /// Low key of the leftmost page of every tree; the first assignable id.
    pub const MIN_KEY: Rid = Rid::new(0, 1);

    /// Exclusive upper bound of the key space; high key of the rightmost
    /// page at every level. Never assigned to a row.
    pub const MAX_KEY: Rid = Rid::new(u32::MAX, u16::MAX);

    /// Largest assignable row id; descending with it reaches the rightmost
    /// leaf.
    pub const MAX_ITEM: Rid = Rid::new(u32::MAX, MAX_MINOR);

    /// Builds a row id from its components.
    pub const fn new(major: u32, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The next assignable row id, rolling into the following major unit
    /// when `minor` is exhausted. Saturates at [`Rid::MAX_ITEM`].
    pub fn next(self) -> Rid {
        if self.minor >= MAX_MINOR {
            if self.major == u32::MAX {
                return Rid::MAX_ITEM;
            }
            Rid::new(self.major + 1, 1)
        } else {
            Rid::new(self.major, self.minor + 1)
        }
    }

    /// Appends the 6-byte big-endian encoding to `out`.
    pub fn encode_into(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.major.to_be_bytes());
        out.extend_from_slice(&self.minor.to_be_bytes());
    }

    /// Writes the encoding into a fixed-position slice.
    pub fn write_to(self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.major.to_be_bytes());
        buf[4..6].copy_from_slice(&self.minor.to_be_bytes());
    }

    /// Decodes a row id from the first [`RID_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RID_LEN {
            return Err(StrataError::Corruption("row id truncated"));
        }
        let major = u32::from_be_bytes(buf[0..4].try_into().expect("sliced to 4 bytes"));
        let minor = u16::from_be_bytes(buf[4..6].try_into().expect("sliced to 2 bytes"));
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.major, self.minor)
    }
}
