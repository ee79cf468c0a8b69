//! Page-management seams
//!
//! The redo pipeline never owns pages. It needs two things from the page
//! layer: proof that an MTR holds a page latch before it may mark the page
//! dirty, and a place to stamp the commit LSN range onto the page. Both are
//! traits; the in-memory implementations here back the driver and the tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::Serialize;

use crate::error::{RedoError, Result};
use crate::types::{Lsn, LsnRange, PageId};

/// Latch-ownership proof for one page. Dropping it releases the latch.
pub trait PageLatch: Send {
    fn page_id(&self) -> PageId;
}

/// Receives the commit LSN range of every page an MTR dirtied
pub trait PageStore: Send + Sync {
    fn stamp(&self, page_id: PageId, range: LsnRange);

    /// The page was written out. Returns false if it was not dirty.
    fn mark_clean(&self, page_id: PageId) -> bool;
}

/// LSN metadata a page carries while dirty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PageLsn {
    /// Start LSN of the first modification since the page was last clean
    pub oldest_modification: Lsn,
    /// End LSN of the latest modification
    pub newest_modification: Lsn,
}

/// In-memory page LSN metadata, keyed by page id
#[derive(Debug, Default)]
pub struct PageLsnTable {
    pages: RwLock<HashMap<PageId, PageLsn>>,
}

impl PageLsnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page_id: PageId) -> Option<PageLsn> {
        self.pages.read().ok()?.get(&page_id).copied()
    }

    pub fn dirty_count(&self) -> usize {
        self.pages.read().map(|pages| pages.len()).unwrap_or(0)
    }
}

impl PageStore for PageLsnTable {
    fn stamp(&self, page_id: PageId, range: LsnRange) {
        if range.is_empty() {
            return;
        }
        if let Ok(mut pages) = self.pages.write() {
            let lsn = pages.entry(page_id).or_insert(PageLsn {
                oldest_modification: range.start,
                newest_modification: range.end,
            });
            lsn.newest_modification = lsn.newest_modification.max(range.end);
        }
    }

    fn mark_clean(&self, page_id: PageId) -> bool {
        match self.pages.write() {
            Ok(mut pages) => pages.remove(&page_id).is_some(),
            Err(_) => false,
        }
    }
}

/// Exclusive page latches held by id
#[derive(Debug, Default)]
pub struct LatchTable {
    held: Mutex<HashSet<PageId>>,
    released: Condvar,
}

impl LatchTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the page is free, then latch it.
    pub fn x_lock(self: &Arc<Self>, page_id: PageId) -> Result<PageXLatch> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| RedoError::Internal("latch table mutex poisoned".to_string()))?;
        while held.contains(&page_id) {
            held = self
                .released
                .wait(held)
                .map_err(|_| RedoError::Internal("latch table condvar wait failed".to_string()))?;
        }
        held.insert(page_id);
        Ok(PageXLatch {
            table: Arc::clone(self),
            page_id,
        })
    }

    /// Latch the page only if nobody holds it.
    pub fn try_x_lock(self: &Arc<Self>, page_id: PageId) -> Option<PageXLatch> {
        let mut held = self.held.lock().ok()?;
        if !held.insert(page_id) {
            return None;
        }
        Some(PageXLatch {
            table: Arc::clone(self),
            page_id,
        })
    }

    pub fn is_latched(&self, page_id: PageId) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&page_id))
            .unwrap_or(false)
    }
}

/// Exclusive latch on one page, released on drop
#[derive(Debug)]
pub struct PageXLatch {
    table: Arc<LatchTable>,
    page_id: PageId,
}

impl PageLatch for PageXLatch {
    fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for PageXLatch {
    fn drop(&mut self) {
        if let Ok(mut held) = self.table.held.lock() {
            held.remove(&self.page_id);
        }
        self.table.released.notify_all();
    }
}
