//! Core value types shared by the redo pipeline

use std::fmt;

use serde::{Deserialize, Serialize};

/// Log Sequence Number - byte offset in the logical, infinite redo stream
pub type Lsn = u64;

/// Tablespace identifier
pub type SpaceId = u32;

/// Page identifier within a tablespace.
///
/// MTRs and the flush list refer to pages by id only; the page objects
/// themselves belong to the page-management layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub space_id: SpaceId,
    pub page_no: u32,
}

impl PageId {
    pub const fn new(space_id: SpaceId, page_no: u32) -> Self {
        Self { space_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[space {}, page {}]", self.space_id, self.page_no)
    }
}

/// Half-open LSN range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LsnRange {
    pub start: Lsn,
    pub end: Lsn,
}

impl LsnRange {
    /// Range assigned to modifications that produced no redo
    pub const UNLOGGED: LsnRange = LsnRange { start: 0, end: 0 };

    pub const fn new(start: Lsn, end: Lsn) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// True when the two ranges share at least one byte
    pub const fn overlaps(&self, other: &LsnRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for LsnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
