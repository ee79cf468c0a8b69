//! Mini-transactions
//!
//! An MTR is the atomic unit of page modification: it collects the redo
//! records for a set of changes and the latches on the pages it changed,
//! and the commit coordinator publishes all of it at once. It is owned by
//! one thread; `commit` takes it by value, so a committed MTR cannot log
//! anything else.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RedoError, Result};
use crate::types::PageId;

use super::page::PageLatch;
use super::record::LogRecord;

static NEXT_MTR_ID: AtomicU64 = AtomicU64::new(1);

/// Whether the MTR generates redo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrMode {
    /// Records are kept and written to the log at commit
    Logged,
    /// Changes need no redo (temporary objects); records are dropped
    NoRedo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrState {
    Active,
    Committed,
    RolledBack,
}

pub struct MiniTransaction {
    id: u64,
    mode: MtrMode,
    state: MtrState,
    records: Vec<LogRecord>,
    log_len: u64,
    /// Dirtied pages in first-modification order, no duplicates
    modified: Vec<PageId>,
    /// Latch memo, released in reverse order
    latches: Vec<Box<dyn PageLatch>>,
}

impl MiniTransaction {
    pub fn new(mode: MtrMode) -> Self {
        Self {
            id: NEXT_MTR_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            state: MtrState::Active,
            records: Vec::new(),
            log_len: 0,
            modified: Vec::new(),
            latches: Vec::new(),
        }
    }

    pub fn logged() -> Self {
        Self::new(MtrMode::Logged)
    }

    pub fn no_redo() -> Self {
        Self::new(MtrMode::NoRedo)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> MtrMode {
        self.mode
    }

    pub fn state(&self) -> MtrState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != MtrState::Active {
            return Err(RedoError::Internal(format!(
                "MTR {} is not active ({:?})",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Append a redo record. In `NoRedo` mode the record is discarded.
    pub fn log(&mut self, record: LogRecord) -> Result<()> {
        self.ensure_active()?;
        if self.mode == MtrMode::NoRedo || record.is_empty() {
            return Ok(());
        }
        self.log_len += record.len() as u64;
        self.records.push(record);
        Ok(())
    }

    /// Hand a page latch to the MTR; it is held until commit or rollback.
    pub fn memo_latch(&mut self, latch: Box<dyn PageLatch>) -> Result<()> {
        self.ensure_active()?;
        self.latches.push(latch);
        Ok(())
    }

    pub fn holds_latch(&self, page_id: PageId) -> bool {
        self.latches.iter().any(|latch| latch.page_id() == page_id)
    }

    /// Record that a latched page was modified.
    pub fn set_modified(&mut self, page_id: PageId) -> Result<()> {
        self.ensure_active()?;
        if !self.holds_latch(page_id) {
            return Err(RedoError::Internal(format!(
                "MTR {} modified page {} without holding its latch",
                self.id, page_id
            )));
        }
        if !self.modified.contains(&page_id) {
            self.modified.push(page_id);
        }
        Ok(())
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Total serialized length of the records
    pub fn log_len(&self) -> u64 {
        self.log_len
    }

    pub fn modified_pages(&self) -> &[PageId] {
        &self.modified
    }

    /// Discard everything and release the latches. Touches no shared state.
    pub fn rollback(mut self) {
        self.records.clear();
        self.log_len = 0;
        self.modified.clear();
        self.release_latches();
        self.state = MtrState::RolledBack;
    }

    /// Final step of a commit
    pub(crate) fn finish_commit(mut self) {
        self.release_latches();
        self.state = MtrState::Committed;
    }

    fn release_latches(&mut self) {
        while let Some(latch) = self.latches.pop() {
            drop(latch);
        }
    }
}

impl Drop for MiniTransaction {
    fn drop(&mut self) {
        if self.state == MtrState::Active && (!self.records.is_empty() || !self.latches.is_empty()) {
            log::warn!(
                "MTR {} dropped without commit; discarding {} records",
                self.id,
                self.records.len()
            );
            self.release_latches();
        }
    }
}

impl std::fmt::Debug for MiniTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniTransaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("records", &self.records.len())
            .field("log_len", &self.log_len)
            .field("modified", &self.modified)
            .field("latches", &self.latches.len())
            .finish()
    }
}
