//! Flush list: dirty pages ordered by the LSN that dirtied them
//!
//! The page cleaner walks this list from the oldest end and the checkpoint
//! is computed from its head, so the order must match LSN order exactly.
//! Commits do not sort into the list: each committed range waits its turn
//! at a turnstile and appends when every lower range has appended, which
//! keeps the list sorted by construction with only the splice under the lock.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{RedoError, Result};
use crate::types::{Lsn, LsnRange, PageId};

/// One commit's modification of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPageEntry {
    pub page_id: PageId,
    pub range: LsnRange,
}

impl DirtyPageEntry {
    pub fn new(page_id: PageId, range: LsnRange) -> Self {
        Self { page_id, range }
    }

    pub fn start_lsn(&self) -> Lsn {
        self.range.start
    }

    pub fn end_lsn(&self) -> Lsn {
        self.range.end
    }
}

#[derive(Debug)]
struct FlushListInner {
    entries: VecDeque<DirtyPageEntry>,
    /// Every range below this LSN has spliced its pages in
    added_up_to: Lsn,
    /// Pages modified without redo; never part of the ordered list
    unlogged: HashSet<PageId>,
}

pub struct FlushList {
    inner: Mutex<FlushListInner>,
    turnstile: Condvar,
}

impl FlushList {
    /// `start_lsn` must equal the log buffer's first LSN.
    pub fn new(start_lsn: Lsn) -> Self {
        Self {
            inner: Mutex::new(FlushListInner {
                entries: VecDeque::new(),
                added_up_to: start_lsn,
                unlogged: HashSet::new(),
            }),
            turnstile: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlushListInner>> {
        self.inner
            .lock()
            .map_err(|_| RedoError::Internal("flush list mutex poisoned".to_string()))
    }

    /// Splice one committed range's pages in LSN order.
    ///
    /// Blocks until every lower range has been spliced. Must be called for
    /// every reserved range, even one without pages, or later commits stall.
    /// Waiting longer than `timeout` means a lower range was lost, which is
    /// a logic defect reported as `OrderingViolation`.
    pub fn insert_batch(&self, range: LsnRange, pages: &[PageId], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock()?;
        while inner.added_up_to != range.start {
            if inner.added_up_to > range.start {
                return Err(RedoError::OrderingViolation(format!(
                    "range {} reached the flush list after LSN {}",
                    range, inner.added_up_to
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RedoError::OrderingViolation(format!(
                    "range {} waited {:?} for ranges below it (added up to {})",
                    range, timeout, inner.added_up_to
                )));
            }
            inner = self
                .turnstile
                .wait_timeout(inner, remaining)
                .map_err(|_| RedoError::Internal("flush list condvar wait failed".to_string()))?
                .0;
        }

        inner
            .entries
            .extend(pages.iter().map(|&page_id| DirtyPageEntry::new(page_id, range)));
        inner.added_up_to = range.end;
        drop(inner);
        self.turnstile.notify_all();
        Ok(())
    }

    /// Insert a single entry; it is the only page of its range.
    pub fn insert(&self, entry: DirtyPageEntry, timeout: Duration) -> Result<()> {
        self.insert_batch(entry.range, &[entry.page_id], timeout)
    }

    /// Track pages modified without redo. They never hold back a checkpoint.
    pub fn add_unlogged(&self, pages: &[PageId]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.unlogged.extend(pages.iter().copied());
        Ok(())
    }

    /// Entry with the smallest start LSN
    pub fn oldest(&self) -> Result<Option<DirtyPageEntry>> {
        Ok(self.lock()?.entries.front().copied())
    }

    pub fn oldest_lsn(&self) -> Result<Option<Lsn>> {
        Ok(self.oldest()?.map(|entry| entry.start_lsn()))
    }

    pub fn added_up_to(&self) -> Result<Lsn> {
        Ok(self.lock()?.added_up_to)
    }

    /// Lowest LSN a checkpoint may advance to: the oldest dirty entry's
    /// start, or `added_up_to` when the list is empty. Read under one lock
    /// so a concurrent splice cannot slip between the two.
    pub fn low_water_mark(&self) -> Result<Lsn> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .front()
            .map_or(inner.added_up_to, |entry| entry.start_lsn().min(inner.added_up_to)))
    }

    /// Drop every entry of a page after it has been written to disk.
    /// Returns how many entries went away.
    pub fn remove(&self, page_id: PageId) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.page_id != page_id);
        let removed_unlogged = inner.unlogged.remove(&page_id);
        Ok(before - inner.entries.len() + usize::from(removed_unlogged))
    }

    /// Oldest entries whose redo is durable, at most `limit` of them.
    ///
    /// Stops at the first entry that is not durable yet, so a page is never
    /// handed out ahead of an older one.
    pub fn flushable(&self, durable_lsn: Lsn, limit: usize) -> Result<Vec<DirtyPageEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .take_while(|entry| entry.end_lsn() <= durable_lsn)
            .take(limit)
            .copied()
            .collect())
    }

    pub fn entries(&self) -> Result<Vec<DirtyPageEntry>> {
        Ok(self.lock()?.entries.iter().copied().collect())
    }

    pub fn unlogged_pages(&self) -> Result<Vec<PageId>> {
        let mut pages: Vec<PageId> = self.lock()?.unlogged.iter().copied().collect();
        pages.sort();
        Ok(pages)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.entries.is_empty())
    }
}
