//! End-to-end tests of the MTR commit pipeline

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use redoline::redo::{LatchTable, PageLsnTable};
use redoline::{
    LogRecord, LsnRange, MiniTransaction, PageId, PageStore, RedoConfig, RedoError, RedoManager,
};
use tempfile::TempDir;

fn setup(config: RedoConfig) -> (TempDir, RedoManager, Arc<PageLsnTable>, Arc<LatchTable>) {
    let temp_dir = TempDir::new().unwrap();
    let pages = Arc::new(PageLsnTable::new());
    let manager = RedoManager::open(
        temp_dir.path().to_path_buf(),
        config,
        Arc::clone(&pages) as Arc<dyn PageStore>,
    )
    .unwrap();
    (temp_dir, manager, pages, LatchTable::new())
}

fn mtr(manager: &RedoManager, latches: &Arc<LatchTable>, pages: &[PageId], sizes: &[usize]) -> MiniTransaction {
    let mut mtr = manager.begin();
    let mut sorted = pages.to_vec();
    sorted.sort();
    for &page in &sorted {
        mtr.memo_latch(Box::new(latches.x_lock(page).unwrap())).unwrap();
        mtr.set_modified(page).unwrap();
    }
    for &size in sizes {
        mtr.log(LogRecord::new(vec![0x5A; size])).unwrap();
    }
    mtr
}

// ============== Scenarios ==============

#[test]
fn test_three_mtrs_get_adjacent_ranges() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig::default());
    let a = manager.commit(mtr(&manager, &latches, &[PageId::new(0, 1)], &[10])).unwrap();
    let b = manager.commit(mtr(&manager, &latches, &[PageId::new(0, 2)], &[20])).unwrap();
    let c = manager.commit(mtr(&manager, &latches, &[PageId::new(0, 3)], &[30])).unwrap();
    assert_eq!((a, b, c), (10, 30, 60));

    let oldest = manager.flush_list().oldest().unwrap().unwrap();
    assert_eq!(oldest.page_id, PageId::new(0, 1));
    assert_eq!(oldest.range, LsnRange::new(0, 10));
}

#[test]
fn test_zero_record_mtr() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig::default());
    let lsn = manager.commit(mtr(&manager, &latches, &[PageId::new(0, 1)], &[])).unwrap();
    assert_eq!(lsn, 0);
    assert!(manager.flush_list().is_empty().unwrap());
    assert_eq!(manager.current_lsn(), 0);
}

#[test]
fn test_threshold_zero_every_commit_times_out_and_proceeds() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig {
        recent_closed_threshold: Some(0),
        max_closed_wait_ms: 20,
        ..RedoConfig::default()
    });

    let started = Instant::now();
    for i in 0..3 {
        manager
            .commit(mtr(&manager, &latches, &[PageId::new(0, i)], &[16]))
            .unwrap();
    }
    assert!(started.elapsed() >= Duration::from_millis(60));
    let stats = manager.stats();
    assert_eq!(stats.commits, 3);
    assert_eq!(stats.closed_wait_timeouts, 3);
    assert_eq!(manager.flush_list().len().unwrap(), 3);
}

#[test]
fn test_three_concurrent_mtrs_fill_small_buffer_disjointly() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig {
        log_buffer_size: 1000,
        recent_closed_threshold: None,
        ..RedoConfig::default()
    });
    let manager = Arc::new(manager);

    let handles: Vec<_> = [10usize, 20, 30]
        .into_iter()
        .enumerate()
        .map(|(i, size)| {
            let manager = Arc::clone(&manager);
            let latches = Arc::clone(&latches);
            thread::spawn(move || {
                let page = PageId::new(0, i as u32);
                manager.commit(mtr(&manager, &latches, &[page], &[size])).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(manager.coordinator().log_buffer().tail_lsn(), 60);
    let ranges: Vec<LsnRange> = manager
        .flush_list()
        .entries()
        .unwrap()
        .iter()
        .map(|e| e.range)
        .collect();
    assert_eq!(ranges.len(), 3);
    assert_eq!(ranges.iter().map(|r| r.len()).sum::<u64>(), 60);
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(a.end <= b.start || b.end <= a.start);
        }
    }
    let mut lengths: Vec<u64> = ranges.iter().map(|r| r.len()).collect();
    lengths.sort();
    assert_eq!(lengths, vec![10, 20, 30]);
}

// ============== Properties ==============

#[test]
fn test_multi_page_mtr_shares_one_range() {
    let (_dir, manager, pages, latches) = setup(RedoConfig::default());
    let touched = [PageId::new(1, 7), PageId::new(1, 3), PageId::new(2, 0)];
    let end = manager.commit(mtr(&manager, &latches, &touched, &[8, 8])).unwrap();
    assert_eq!(end, 16);

    let entries = manager.flush_list().entries().unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.range == LsnRange::new(0, 16)));
    for page in touched {
        assert_eq!(pages.get(page).unwrap().oldest_modification, 0);
        assert!(!latches.is_latched(page));
    }
}

#[test]
fn test_causal_order_across_threads() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig {
        log_buffer_size: 8192,
        ..RedoConfig::low_concurrency()
    });
    let manager = Arc::new(manager);

    // every thread keeps hitting the same hot page plus a private one
    let hot = PageId::new(9, 9);
    let mut handles = Vec::new();
    for t in 0..6u32 {
        let manager = Arc::clone(&manager);
        let latches = Arc::clone(&latches);
        handles.push(thread::spawn(move || {
            for i in 0..40u32 {
                let m = mtr(&manager, &latches, &[hot, PageId::new(t, i)], &[24]);
                manager.commit(m).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = manager.flush_list().entries().unwrap();
    assert_eq!(entries.len(), 6 * 40 * 2);
    for pair in entries.windows(2) {
        assert!(pair[0].start_lsn() <= pair[1].start_lsn());
    }
    let hot_ranges: Vec<LsnRange> = entries
        .iter()
        .filter(|e| e.page_id == hot)
        .map(|e| e.range)
        .collect();
    for pair in hot_ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start);
    }
}

#[test]
fn test_no_redo_pages_never_hold_back_checkpoint() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig::default());
    let temp_page = PageId::new(100, 1);
    let mut m = manager.begin_no_redo();
    m.memo_latch(Box::new(latches.x_lock(temp_page).unwrap())).unwrap();
    m.set_modified(temp_page).unwrap();
    m.log(LogRecord::new(vec![1u8; 32])).unwrap();
    assert_eq!(manager.commit(m).unwrap(), 0);

    let end = manager.commit(mtr(&manager, &latches, &[PageId::new(0, 1)], &[32])).unwrap();
    manager.page_flushed(PageId::new(0, 1)).unwrap();

    let info = manager.checkpoint().unwrap();
    assert_eq!(info.checkpoint_lsn, end);
    assert_eq!(manager.flush_list().unlogged_pages().unwrap(), vec![temp_page]);
}

#[test]
fn test_page_cleaner_only_sees_durable_pages() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig::high_throughput());
    let end = manager.commit(mtr(&manager, &latches, &[PageId::new(0, 1)], &[64])).unwrap();

    let durable = manager.flush_up_to(end).unwrap();
    let ready = manager.flush_list().flushable(durable, 16).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].end_lsn(), end);
}

#[test]
fn test_tiny_buffer_recycles_under_load() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig {
        log_buffer_size: 1024,
        recent_closed_threshold: Some(512),
        ..RedoConfig::default()
    });
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let manager = Arc::clone(&manager);
        let latches = Arc::clone(&latches);
        handles.push(thread::spawn(move || {
            for i in 0..100u32 {
                manager
                    .commit(mtr(&manager, &latches, &[PageId::new(t, i)], &[100]))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(manager.current_lsn(), 4 * 100 * 100);
    assert_eq!(manager.flush_up_to(40_000).unwrap(), 40_000);
}

#[test]
fn test_oversized_mtr_is_commit_failed() {
    let (_dir, manager, _pages, latches) = setup(RedoConfig {
        log_buffer_size: 1024,
        recent_closed_threshold: None,
        ..RedoConfig::default()
    });
    let page = PageId::new(0, 1);
    let err = manager.commit(mtr(&manager, &latches, &[page], &[4096])).unwrap_err();
    assert!(matches!(err, RedoError::CommitFailed(_)));
    assert!(!latches.is_latched(page));
    assert!(manager.flush_list().is_empty().unwrap());
}
