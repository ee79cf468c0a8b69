//! Commit coordinator
//!
//! Turns a finished MTR into durable-ordered state:
//! 1. Reserve an LSN range in the log buffer (retrying while it is full)
//! 2. Copy the MTR's records into the range in order and close it
//! 3. Optionally wait for the not-yet-durable backlog to shrink
//! 4. Splice the dirtied pages into the flush list under the commit range
//! 5. Stamp the pages and release their latches
//!
//! Everything that can fail for ordinary reasons happens before the
//! reservation. Once a range is reserved only fatal defects can stop a
//! commit, so a range is never left without its flush-list splice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::error::{RedoError, Result};
use crate::types::{Lsn, LsnRange};

use super::config::RedoConfig;
use super::flush_list::FlushList;
use super::log_buffer::{LogBuffer, Reservation};
use super::mtr::{MiniTransaction, MtrMode};
use super::page::PageStore;
use super::waiter::{DurabilityWaiter, WaitOutcome};
use super::writer::LogWriter;

/// Reservation attempts that only spin
const SPIN_ATTEMPTS: u32 = 16;
/// Reservation attempts that yield before we start sleeping
const YIELD_ATTEMPTS: u32 = 64;
const MAX_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct CommitStats {
    commits: AtomicU64,
    empty_commits: AtomicU64,
    unlogged_commits: AtomicU64,
    failed_commits: AtomicU64,
    bytes_logged: AtomicU64,
    reserve_retries: AtomicU64,
    closed_waits: AtomicU64,
    closed_wait_timeouts: AtomicU64,
}

/// Point-in-time copy of the commit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStatsSnapshot {
    /// Commits that wrote redo
    pub commits: u64,
    /// Logged-mode commits without records
    pub empty_commits: u64,
    /// `NoRedo` commits
    pub unlogged_commits: u64,
    pub failed_commits: u64,
    pub bytes_logged: u64,
    pub reserve_retries: u64,
    /// Commits that had to wait for the backlog to shrink
    pub closed_waits: u64,
    pub closed_wait_timeouts: u64,
    pub tail_lsn: Lsn,
    pub closed_lsn: Lsn,
    pub durable_lsn: Lsn,
}

pub struct CommitCoordinator {
    log_buffer: Arc<LogBuffer>,
    flush_list: Arc<FlushList>,
    waiter: DurabilityWaiter,
    writer: Arc<LogWriter>,
    pages: Arc<dyn PageStore>,
    config: RedoConfig,
    stats: CommitStats,
}

impl CommitCoordinator {
    pub fn new(
        log_buffer: Arc<LogBuffer>,
        flush_list: Arc<FlushList>,
        writer: Arc<LogWriter>,
        pages: Arc<dyn PageStore>,
        config: RedoConfig,
    ) -> Self {
        let waiter = DurabilityWaiter::new(Arc::clone(&log_buffer), Arc::clone(writer.state()));
        Self {
            log_buffer,
            flush_list,
            waiter,
            writer,
            pages,
            config,
            stats: CommitStats::default(),
        }
    }

    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        &self.log_buffer
    }

    pub fn flush_list(&self) -> &Arc<FlushList> {
        &self.flush_list
    }

    pub fn waiter(&self) -> &DurabilityWaiter {
        &self.waiter
    }

    pub fn config(&self) -> &RedoConfig {
        &self.config
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.waiter.state().durable_lsn()
    }

    /// Commit an MTR. Returns the end LSN of its log range, or 0 when it
    /// produced no redo.
    pub fn commit(&self, mtr: MiniTransaction) -> Result<Lsn> {
        if let Err(e) = self.waiter.state().check_healthy() {
            return Err(self.abandon(mtr, e));
        }

        let log_len = mtr.log_len();
        if log_len == 0 {
            return self.commit_without_redo(mtr);
        }

        let mut reservation = match self.reserve_with_retry(log_len) {
            Ok(reservation) => reservation,
            Err(e) => return Err(self.abandon(mtr, e)),
        };

        for record in mtr.records() {
            self.log_buffer.write_into(&mut reservation, record.as_bytes())?;
        }
        let range = self.log_buffer.close(reservation)?;
        self.writer.nudge();

        if let Some(threshold) = self.config.recent_closed_threshold {
            match self
                .waiter
                .wait_until_closed_below(threshold, self.config.max_closed_wait())?
            {
                WaitOutcome::Immediate | WaitOutcome::WriterStopped => {}
                WaitOutcome::Satisfied => {
                    self.stats.closed_waits.fetch_add(1, Ordering::Relaxed);
                }
                WaitOutcome::TimedOut { .. } => {
                    self.stats.closed_waits.fetch_add(1, Ordering::Relaxed);
                    self.stats.closed_wait_timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.flush_list
            .insert_batch(range, mtr.modified_pages(), self.config.flush_order_timeout())?;
        for &page_id in mtr.modified_pages() {
            self.pages.stamp(page_id, range);
        }
        mtr.finish_commit();

        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_logged.fetch_add(range.len(), Ordering::Relaxed);
        log::trace!("Committed MTR range {}", range);
        Ok(range.end)
    }

    fn commit_without_redo(&self, mtr: MiniTransaction) -> Result<Lsn> {
        if mtr.mode() == MtrMode::NoRedo {
            if let Err(e) = self.flush_list.add_unlogged(mtr.modified_pages()) {
                return Err(self.abandon(mtr, e));
            }
            for &page_id in mtr.modified_pages() {
                self.pages.stamp(page_id, LsnRange::UNLOGGED);
            }
            self.stats.unlogged_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.empty_commits.fetch_add(1, Ordering::Relaxed);
        }
        mtr.finish_commit();
        Ok(0)
    }

    /// Roll back a commit that never reserved a range.
    fn abandon(&self, mtr: MiniTransaction, error: RedoError) -> RedoError {
        self.stats.failed_commits.fetch_add(1, Ordering::Relaxed);
        log::debug!("MTR {} not committed: {}", mtr.id(), error);
        mtr.rollback();
        error
    }

    /// Reserve `len` bytes, waiting for the writer to free space when the
    /// buffer is full.
    fn reserve_with_retry(&self, len: u64) -> Result<Reservation> {
        let mut attempt: u32 = 0;
        loop {
            match self.log_buffer.reserve(len) {
                Ok(reservation) => return Ok(reservation),
                Err(RedoError::BufferExhausted {
                    requested,
                    available,
                }) => {
                    if attempt >= self.config.reserve_retry_limit {
                        return Err(RedoError::CommitFailed(format!(
                            "log buffer still full after {} retries: requested {} bytes, {} available",
                            attempt, requested, available
                        )));
                    }
                    attempt += 1;
                    self.stats.reserve_retries.fetch_add(1, Ordering::Relaxed);
                    self.waiter.state().check_healthy()?;
                    self.writer.nudge();
                    backoff(attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Make everything up to `lsn` durable. Returns the durable LSN.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<Lsn> {
        let state = self.waiter.state();
        state.check_healthy()?;
        if state.durable_lsn() >= lsn {
            return Ok(state.durable_lsn());
        }
        self.writer.request_sync()?;
        self.waiter
            .wait_for_durable(lsn, self.config.durable_wait_timeout())?;
        Ok(state.durable_lsn())
    }

    pub fn rollback(&self, mtr: MiniTransaction) {
        mtr.rollback();
    }

    pub fn stats(&self) -> CommitStatsSnapshot {
        let stats = &self.stats;
        CommitStatsSnapshot {
            commits: stats.commits.load(Ordering::Relaxed),
            empty_commits: stats.empty_commits.load(Ordering::Relaxed),
            unlogged_commits: stats.unlogged_commits.load(Ordering::Relaxed),
            failed_commits: stats.failed_commits.load(Ordering::Relaxed),
            bytes_logged: stats.bytes_logged.load(Ordering::Relaxed),
            reserve_retries: stats.reserve_retries.load(Ordering::Relaxed),
            closed_waits: stats.closed_waits.load(Ordering::Relaxed),
            closed_wait_timeouts: stats.closed_wait_timeouts.load(Ordering::Relaxed),
            tail_lsn: self.log_buffer.tail_lsn(),
            closed_lsn: self.log_buffer.closed_lsn(),
            durable_lsn: self.durable_lsn(),
        }
    }
}

/// Spin, then yield, then sleep with a growing delay.
fn backoff(attempt: u32) {
    if attempt <= SPIN_ATTEMPTS {
        std::hint::spin_loop();
    } else if attempt <= YIELD_ATTEMPTS {
        thread::yield_now();
    } else {
        let micros = 10u64 << (attempt - YIELD_ATTEMPTS).min(7);
        thread::sleep(Duration::from_micros(micros).min(MAX_BACKOFF));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redo::page::{LatchTable, PageLsnTable};
    use crate::redo::record::LogRecord;
    use crate::redo::waiter::DurableState;
    use crate::types::PageId;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        coordinator: Arc<CommitCoordinator>,
        pages: Arc<PageLsnTable>,
        latches: Arc<LatchTable>,
        _dir: TempDir,
    }

    fn fixture(config: RedoConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let buffer = Arc::new(LogBuffer::with_start_lsn(config.log_buffer_size, config.start_lsn));
        let state = Arc::new(DurableState::new(config.start_lsn));
        let writer = Arc::new(
            LogWriter::open(&dir.path().join("redo.log"), Arc::clone(&buffer), state, &config)
                .unwrap(),
        );
        let pages = Arc::new(PageLsnTable::new());
        let flush_list = Arc::new(FlushList::new(config.start_lsn));
        let coordinator = Arc::new(CommitCoordinator::new(
            buffer,
            flush_list,
            writer,
            Arc::clone(&pages) as Arc<dyn PageStore>,
            config,
        ));
        Fixture {
            coordinator,
            pages,
            latches: LatchTable::new(),
            _dir: dir,
        }
    }

    fn mtr_with(fx: &Fixture, page: PageId, sizes: &[usize]) -> MiniTransaction {
        let mut mtr = MiniTransaction::logged();
        mtr.memo_latch(Box::new(fx.latches.x_lock(page).unwrap())).unwrap();
        mtr.set_modified(page).unwrap();
        for &size in sizes {
            mtr.log(LogRecord::new(vec![0xAB; size])).unwrap();
        }
        mtr
    }

    #[test]
    fn test_sequential_commits_get_consecutive_ranges() {
        let fx = fixture(RedoConfig::default());
        let a = mtr_with(&fx, PageId::new(0, 1), &[10]);
        let b = mtr_with(&fx, PageId::new(0, 2), &[20]);
        let c = mtr_with(&fx, PageId::new(0, 3), &[30]);

        assert_eq!(fx.coordinator.commit(a).unwrap(), 10);
        assert_eq!(fx.coordinator.commit(b).unwrap(), 30);
        assert_eq!(fx.coordinator.commit(c).unwrap(), 60);

        let entries = fx.coordinator.flush_list().entries().unwrap();
        let ranges: Vec<LsnRange> = entries.iter().map(|e| e.range).collect();
        assert_eq!(
            ranges,
            vec![LsnRange::new(0, 10), LsnRange::new(10, 30), LsnRange::new(30, 60)]
        );
        assert_eq!(fx.coordinator.stats().commits, 3);
        assert_eq!(fx.coordinator.stats().bytes_logged, 60);
    }

    #[test]
    fn test_records_are_copied_in_order() {
        let fx = fixture(RedoConfig::default());
        let page = PageId::new(0, 1);
        let mut mtr = MiniTransaction::logged();
        mtr.memo_latch(Box::new(fx.latches.x_lock(page).unwrap())).unwrap();
        mtr.set_modified(page).unwrap();
        mtr.log(LogRecord::new(b"first-".to_vec())).unwrap();
        mtr.log(LogRecord::new(b"second".to_vec())).unwrap();

        let end = fx.coordinator.commit(mtr).unwrap();
        fx.coordinator.flush_up_to(end).unwrap();
        assert_eq!(end, 12);
        assert!(!fx.latches.is_latched(page));

        let lsn = fx.pages.get(page).unwrap();
        assert_eq!(lsn.oldest_modification, 0);
        assert_eq!(lsn.newest_modification, 12);
    }

    #[test]
    fn test_zero_record_commit_returns_zero() {
        let fx = fixture(RedoConfig::default());
        let page = PageId::new(0, 9);
        let mut mtr = MiniTransaction::logged();
        mtr.memo_latch(Box::new(fx.latches.x_lock(page).unwrap())).unwrap();
        mtr.set_modified(page).unwrap();

        assert_eq!(fx.coordinator.commit(mtr).unwrap(), 0);
        assert!(fx.coordinator.flush_list().is_empty().unwrap());
        assert_eq!(fx.coordinator.log_buffer().tail_lsn(), 0);
        assert!(!fx.latches.is_latched(page));
        assert_eq!(fx.coordinator.stats().empty_commits, 1);
    }

    #[test]
    fn test_no_redo_commit_registers_unlogged_pages() {
        let fx = fixture(RedoConfig::default());
        let page = PageId::new(7, 1);
        let mut mtr = MiniTransaction::no_redo();
        mtr.memo_latch(Box::new(fx.latches.x_lock(page).unwrap())).unwrap();
        mtr.set_modified(page).unwrap();
        mtr.log(LogRecord::new(vec![1u8; 40])).unwrap();

        assert_eq!(fx.coordinator.commit(mtr).unwrap(), 0);
        let flush_list = fx.coordinator.flush_list();
        assert_eq!(flush_list.oldest().unwrap(), None);
        assert_eq!(flush_list.unlogged_pages().unwrap(), vec![page]);
        assert_eq!(fx.pages.get(page), None);
        assert_eq!(fx.coordinator.stats().unlogged_commits, 1);
    }

    #[test]
    fn test_concurrent_commits_disjoint_and_ordered() {
        let fx = fixture(RedoConfig {
            log_buffer_size: 4096,
            ..RedoConfig::default()
        });
        let threads = 8;
        let per_thread = 50;

        let mut handles = Vec::new();
        for t in 0..threads {
            let coordinator = Arc::clone(&fx.coordinator);
            let latches = Arc::clone(&fx.latches);
            handles.push(thread::spawn(move || {
                let mut ends = Vec::new();
                for i in 0..per_thread {
                    let page = PageId::new(t, i);
                    let mut mtr = MiniTransaction::logged();
                    mtr.memo_latch(Box::new(latches.x_lock(page).unwrap())).unwrap();
                    mtr.set_modified(page).unwrap();
                    mtr.log(LogRecord::new(vec![t as u8; 16 + i as usize])).unwrap();
                    ends.push(coordinator.commit(mtr).unwrap());
                }
                ends
            }));
        }
        let mut total = 0u64;
        for handle in handles {
            total += handle.join().unwrap().len() as u64;
        }
        assert_eq!(total, (threads * per_thread) as u64);

        let entries = fx.coordinator.flush_list().entries().unwrap();
        assert_eq!(entries.len(), (threads * per_thread) as usize);
        for pair in entries.windows(2) {
            // disjoint, gap-free and in LSN order
            assert_eq!(pair[0].range.end, pair[1].range.start);
        }
        let last = entries.last().unwrap().range.end;
        assert_eq!(fx.coordinator.log_buffer().tail_lsn(), last);
        assert_eq!(fx.coordinator.flush_up_to(last).unwrap(), last);
    }

    #[test]
    fn test_threshold_zero_waits_then_proceeds() {
        let fx = fixture(RedoConfig {
            recent_closed_threshold: Some(0),
            max_closed_wait_ms: 30,
            ..RedoConfig::default()
        });
        let started = Instant::now();
        let end = fx
            .coordinator
            .commit(mtr_with(&fx, PageId::new(0, 1), &[8]))
            .unwrap();
        assert_eq!(end, 8);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(fx.coordinator.stats().closed_wait_timeouts, 1);
        assert_eq!(fx.coordinator.flush_list().len().unwrap(), 1);
    }

    #[test]
    fn test_oversized_mtr_fails_without_registration() {
        let fx = fixture(RedoConfig {
            log_buffer_size: 1024,
            recent_closed_threshold: None,
            ..RedoConfig::default()
        });
        let page = PageId::new(0, 1);
        let err = fx
            .coordinator
            .commit(mtr_with(&fx, page, &[2048]))
            .unwrap_err();
        assert!(matches!(err, RedoError::CommitFailed(_)));
        assert!(fx.coordinator.flush_list().is_empty().unwrap());
        assert!(!fx.latches.is_latched(page));
        assert_eq!(fx.coordinator.stats().failed_commits, 1);
    }

    #[test]
    fn test_full_buffer_escalates_to_commit_failed() {
        let fx = fixture(RedoConfig {
            log_buffer_size: 1024,
            recent_closed_threshold: None,
            reserve_retry_limit: 80,
            ..RedoConfig::default()
        });
        // an open reservation pins the whole buffer; the writer cannot free it
        let pin = fx.coordinator.log_buffer().reserve(1000).unwrap();

        let err = fx
            .coordinator
            .commit(mtr_with(&fx, PageId::new(0, 1), &[100]))
            .unwrap_err();
        assert!(matches!(err, RedoError::CommitFailed(_)));
        assert!(!err.is_fatal());
        assert_eq!(fx.coordinator.stats().reserve_retries, 80);
        drop(pin);
    }

    #[test]
    fn test_commits_recycle_a_small_buffer() {
        let fx = fixture(RedoConfig {
            log_buffer_size: 512,
            recent_closed_threshold: None,
            ..RedoConfig::default()
        });
        let mut end = 0;
        for i in 0..100 {
            end = fx
                .coordinator
                .commit(mtr_with(&fx, PageId::new(0, i), &[100]))
                .unwrap();
        }
        assert_eq!(end, 10_000);
        assert_eq!(fx.coordinator.flush_up_to(end).unwrap(), end);
    }

    #[test]
    fn test_flush_up_to_reaches_durable() {
        let fx = fixture(RedoConfig::high_throughput());
        let end = fx
            .coordinator
            .commit(mtr_with(&fx, PageId::new(0, 1), &[64]))
            .unwrap();
        assert!(fx.coordinator.flush_up_to(end).unwrap() >= end);
        assert_eq!(fx.coordinator.flush_up_to(0).unwrap(), fx.coordinator.durable_lsn());
    }

    #[test]
    fn test_rollback_touches_no_shared_state() {
        let fx = fixture(RedoConfig::default());
        let page = PageId::new(0, 4);
        let mtr = mtr_with(&fx, page, &[10]);
        fx.coordinator.rollback(mtr);

        assert!(!fx.latches.is_latched(page));
        assert_eq!(fx.coordinator.log_buffer().tail_lsn(), 0);
        assert!(fx.coordinator.flush_list().is_empty().unwrap());
        assert_eq!(fx.coordinator.stats(), CommitStatsSnapshot::default());
    }
}
