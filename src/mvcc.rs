//! Row-level MVCC bookkeeping and the visibility/delete collaborator traits.
//!
//! The first attribute of a table prefixes every stored value with a fixed
//! [`RowHeader`] carrying the commit window of the row. The tree core never
//! interprets the window itself; it hands the header to a
//! [`VisibilityOracle`] during scans and to a [`DeleteMutator`] when a row
//! is marked deleted in place.

use crate::types::{PageId, Result, Rid, StrataError};

/// Identifier assigned to every committed write.
pub type CommitId = u64;

/// Sentinel commit id meaning "visible forever".
pub const COMMIT_MAX: CommitId = 0;

/// Length of the encoded [`RowHeader`] in bytes.
pub const ROW_HEADER_LEN: usize = 18;

/// Row header flags.
pub mod flags {
    /// Row has been marked deleted.
    pub const DELETED: u16 = 0x0001;
}

/// Fixed-size MVCC header stored at the front of attribute-1 payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RowHeader {
    /// First commit id at which the row is visible.
    pub begin: CommitId,
    /// Exclusive commit id at which visibility ends; [`COMMIT_MAX`] (zero)
    /// means unbounded.
    pub end: CommitId,
    /// Bitflags captured in [`flags`].
    pub flags: u16,
}

impl RowHeader {
    /// Builds a header for a row inserted at `begin`, visible indefinitely.
    pub const fn inserted_at(begin: CommitId) -> Self {
        Self {
            begin,
            end: COMMIT_MAX,
            flags: 0,
        }
    }

    /// Encodes the header into a fixed array.
    pub fn encode(&self) -> [u8; ROW_HEADER_LEN] {
        let mut buf = [0u8; ROW_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.begin.to_be_bytes());
        buf[8..16].copy_from_slice(&self.end.to_be_bytes());
        buf[16..18].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    /// Appends the encoded header to an output buffer.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.encode());
    }

    /// Decodes a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ROW_HEADER_LEN {
            return Err(StrataError::Corruption("row header truncated"));
        }
        let begin = CommitId::from_be_bytes(bytes[0..8].try_into().expect("sliced to 8 bytes"));
        let end = CommitId::from_be_bytes(bytes[8..16].try_into().expect("sliced to 8 bytes"));
        let flags = u16::from_be_bytes(bytes[16..18].try_into().expect("sliced to 2 bytes"));
        Ok(Self { begin, end, flags })
    }

    /// Returns `true` when the row is visible at `snapshot`.
    pub fn visible_at(&self, snapshot: CommitId) -> bool {
        if snapshot < self.begin {
            return false;
        }
        if self.end == COMMIT_MAX {
            return true;
        }
        snapshot < self.end
    }

    /// Returns `true` when the row carries the deleted flag.
    pub fn is_deleted(&self) -> bool {
        (self.flags & flags::DELETED) != 0
    }
}

/// A reader's view of the commit history.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Snapshot {
    commit: CommitId,
}

impl Snapshot {
    /// Snapshot that observes every commit up to and including `commit`.
    pub const fn at(commit: CommitId) -> Self {
        Self { commit }
    }

    /// The commit id this snapshot observes.
    pub fn commit(&self) -> CommitId {
        self.commit
    }
}

/// Decides whether a row is visible to a snapshot.
///
/// The page id of the leaf currently holding the row is passed along so
/// implementations may cache visibility hints per page; the reference
/// implementation ignores it.
pub trait VisibilityOracle: Send + Sync {
    /// Evaluates `header` against `snapshot` for the row at `rid`.
    fn is_visible(&self, header: &RowHeader, rid: Rid, snapshot: Snapshot, page: PageId) -> bool;
}

/// Visibility derived purely from the row header's commit window.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotVisibility;

impl VisibilityOracle for SnapshotVisibility {
    fn is_visible(&self, header: &RowHeader, _rid: Rid, snapshot: Snapshot, _page: PageId) -> bool {
        header.visible_at(snapshot.commit())
    }
}

/// Applies the mark-as-deleted mutation to a located row header.
pub trait DeleteMutator: Send + Sync {
    /// Rewrites `header` so the row at `rid` stops being visible.
    fn mark_deleted(&self, header: &mut RowHeader, rid: Rid) -> Result<()>;
}

/// Deleter that closes the visibility window at a fixed commit.
#[derive(Clone, Copy, Debug)]
pub struct CommitDeleter {
    commit: CommitId,
}

impl CommitDeleter {
    /// Builds a deleter acting on behalf of `commit`.
    pub const fn at(commit: CommitId) -> Self {
        Self { commit }
    }
}

impl DeleteMutator for CommitDeleter {
    fn mark_deleted(&self, header: &mut RowHeader, _rid: Rid) -> Result<()> {
        if header.is_deleted() {
            return Err(StrataError::Invalid("row is already deleted"));
        }
        header.end = self.commit;
        header.flags |= flags::DELETED;
        Ok(())
    }
}
