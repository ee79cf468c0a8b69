//! Redo manager
//!
//! Owns the whole pipeline for one data directory.
//!
//! ### Startup
//! 1. Read the checkpoint marker and scan `redo.log`
//! 2. Cut off a torn tail, if any
//! 3. Resume LSNs at the larger of the scan end and the checkpoint. The
//!    configured `start_lsn` only applies to a directory with no redo and
//!    no checkpoint.
//! 4. Start the log writer appending to the same file
//!
//! ### Files
//! - `redo.log`: length-prefixed, checksummed redo blocks
//! - `redo.checkpoint`: JSON checkpoint marker

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::types::{Lsn, PageId};

use super::checkpoint::{CheckpointInfo, Checkpointer};
use super::config::RedoConfig;
use super::coordinator::{CommitCoordinator, CommitStatsSnapshot};
use super::flush_list::FlushList;
use super::log_buffer::LogBuffer;
use super::mtr::MiniTransaction;
use super::page::PageStore;
use super::recovery::{RecoveredLog, RedoScanner};
use super::waiter::DurableState;
use super::writer::LogWriter;

pub struct RedoManager {
    data_dir: PathBuf,
    writer: Arc<LogWriter>,
    coordinator: CommitCoordinator,
    checkpointer: Checkpointer,
    pages: Arc<dyn PageStore>,
    /// Scan result from startup, until the caller takes it
    recovered: Mutex<Option<RecoveredLog>>,
}

impl RedoManager {
    /// Open with the default configuration
    pub fn new(data_dir: PathBuf, pages: Arc<dyn PageStore>) -> Result<Self> {
        Self::open(data_dir, RedoConfig::default(), pages)
    }

    pub fn open(data_dir: PathBuf, config: RedoConfig, pages: Arc<dyn PageStore>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&data_dir)?;

        let scanner = RedoScanner::new(&data_dir);
        let recovered = scanner.scan()?;
        scanner.repair(&recovered)?;

        let resume_lsn = recovered.resume_lsn();
        let fresh = recovered.blocks == 0 && recovered.checkpoint.is_none();
        let start_lsn = if fresh {
            resume_lsn.max(config.start_lsn)
        } else {
            if config.start_lsn > resume_lsn {
                log::warn!(
                    "Ignoring configured start LSN {}: existing redo resumes at LSN {}",
                    config.start_lsn,
                    resume_lsn
                );
            }
            resume_lsn
        };
        log::info!(
            "Opening redo log in {:?} at LSN {} (checkpoint {})",
            data_dir,
            start_lsn,
            recovered.checkpoint_lsn()
        );

        let log_buffer = Arc::new(LogBuffer::with_start_lsn(config.log_buffer_size, start_lsn));
        let state = Arc::new(DurableState::new(start_lsn));
        let writer = Arc::new(LogWriter::open(
            &scanner.redo_path(),
            Arc::clone(&log_buffer),
            state,
            &config,
        )?);
        let flush_list = Arc::new(FlushList::new(start_lsn));
        let checkpointer = Checkpointer::new(
            &data_dir,
            Arc::clone(&flush_list),
            Arc::clone(&writer),
            recovered.checkpoint,
        );
        let coordinator = CommitCoordinator::new(
            log_buffer,
            flush_list,
            Arc::clone(&writer),
            Arc::clone(&pages),
            config,
        );

        Ok(Self {
            data_dir,
            writer,
            coordinator,
            checkpointer,
            pages,
            recovered: Mutex::new(Some(recovered)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &RedoConfig {
        self.coordinator.config()
    }

    pub fn coordinator(&self) -> &CommitCoordinator {
        &self.coordinator
    }

    pub fn flush_list(&self) -> &Arc<FlushList> {
        self.coordinator.flush_list()
    }

    /// Start a logged MTR
    pub fn begin(&self) -> MiniTransaction {
        MiniTransaction::logged()
    }

    /// Start an MTR whose changes need no redo
    pub fn begin_no_redo(&self) -> MiniTransaction {
        MiniTransaction::no_redo()
    }

    pub fn commit(&self, mtr: MiniTransaction) -> Result<Lsn> {
        self.coordinator.commit(mtr)
    }

    pub fn rollback(&self, mtr: MiniTransaction) {
        self.coordinator.rollback(mtr);
    }

    /// Commit and wait until the MTR's redo is durable.
    pub fn commit_durable(&self, mtr: MiniTransaction) -> Result<Lsn> {
        let lsn = self.coordinator.commit(mtr)?;
        if lsn > 0 {
            self.coordinator.flush_up_to(lsn)?;
        }
        Ok(lsn)
    }

    pub fn flush_up_to(&self, lsn: Lsn) -> Result<Lsn> {
        self.coordinator.flush_up_to(lsn)
    }

    /// The page was written to its tablespace; it no longer holds back
    /// the checkpoint and its modification LSNs start over.
    pub fn page_flushed(&self, page_id: PageId) -> Result<usize> {
        let removed = self.flush_list().remove(page_id)?;
        self.pages.mark_clean(page_id);
        Ok(removed)
    }

    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.checkpointer.checkpoint()
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.checkpointer.last_checkpoint()
    }

    /// Next LSN to be handed out
    pub fn current_lsn(&self) -> Lsn {
        self.coordinator.log_buffer().tail_lsn()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.writer.durable_lsn()
    }

    pub fn stats(&self) -> CommitStatsSnapshot {
        self.coordinator.stats()
    }

    /// Startup scan result. Returns `None` after the first call.
    pub fn take_recovered(&self) -> Option<RecoveredLog> {
        self.recovered.lock().ok()?.take()
    }

    /// Drain and fsync everything, then stop the writer.
    pub fn shutdown(&self) -> Result<()> {
        self.writer.shutdown()?;
        log::info!("Redo manager shut down at LSN {}", self.durable_lsn());
        Ok(())
    }
}
