//! Checkpoints
//!
//! A checkpoint LSN is a point below which every change is already in the
//! data pages: no dirty page still needs redo from there. It is the smallest
//! of the oldest dirty page's start LSN, the flush list's added-up-to LSN,
//! and the durable LSN. The marker is a small JSON file; once the redo file
//! holds nothing above the checkpoint the writer may empty it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{RedoError, Result};
use crate::types::Lsn;

use super::flush_list::FlushList;
use super::writer::LogWriter;

pub const CHECKPOINT_FILE: &str = "redo.checkpoint";

/// Contents of the checkpoint marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_lsn: Lsn,
    pub durable_lsn: Lsn,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl CheckpointInfo {
    pub fn new(checkpoint_lsn: Lsn, durable_lsn: Lsn) -> Self {
        Self {
            checkpoint_lsn,
            durable_lsn,
            timestamp: timestamp(),
        }
    }

    /// Read a marker; `None` when there is none yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        let info: CheckpointInfo = serde_json::from_str(&contents)
            .map_err(|e| RedoError::Corrupt(format!("checkpoint {}: {}", path.display(), e)))?;
        Ok(Some(info))
    }

    /// Replace the marker atomically (write aside, fsync, rename).
    pub fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("checkpoint.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Checkpointer {
    path: PathBuf,
    flush_list: Arc<FlushList>,
    writer: Arc<LogWriter>,
    last: Mutex<Option<CheckpointInfo>>,
}

impl Checkpointer {
    pub fn new(
        data_dir: &Path,
        flush_list: Arc<FlushList>,
        writer: Arc<LogWriter>,
        last: Option<CheckpointInfo>,
    ) -> Self {
        Self {
            path: data_dir.join(CHECKPOINT_FILE),
            flush_list,
            writer,
            last: Mutex::new(last),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The LSN a checkpoint taken now would record
    pub fn checkpoint_lsn(&self) -> Result<Lsn> {
        let durable = self.writer.durable_lsn();
        Ok(self.flush_list.low_water_mark()?.min(durable))
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.last.lock().ok().and_then(|last| *last)
    }

    /// Sync the log, persist a new marker and truncate the redo file if the
    /// marker covers all of it.
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| RedoError::Internal("checkpoint mutex poisoned".to_string()))?;

        let durable = self.writer.force_sync()?;
        let mut checkpoint_lsn = self.checkpoint_lsn()?;
        if let Some(previous) = last.as_ref() {
            checkpoint_lsn = checkpoint_lsn.max(previous.checkpoint_lsn);
        }

        let info = CheckpointInfo::new(checkpoint_lsn, durable);
        info.store(&self.path)?;
        let truncated = self.writer.truncate(checkpoint_lsn)?;
        log::info!(
            "Checkpoint at LSN {} (durable {}){}",
            checkpoint_lsn,
            durable,
            if truncated { ", redo file truncated" } else { "" }
        );

        *last = Some(info);
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redo::config::RedoConfig;
    use crate::redo::log_buffer::LogBuffer;
    use crate::redo::waiter::DurableState;
    use crate::types::PageId;
    use std::time::Duration;
    use tempfile::tempdir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_checkpoint_info_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        assert_eq!(CheckpointInfo::load(&path).unwrap(), None);

        let info = CheckpointInfo::new(120, 150);
        info.store(&path).unwrap();
        assert_eq!(CheckpointInfo::load(&path).unwrap(), Some(info));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["checkpoint_lsn"], 120);
        assert_eq!(json["durable_lsn"], 150);
    }

    #[test]
    fn test_corrupt_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CheckpointInfo::load(&path),
            Err(RedoError::Corrupt(_))
        ));
    }

    #[test]
    fn test_checkpoint_held_back_by_dirty_page() {
        let dir = tempdir().unwrap();
        let config = RedoConfig::default();
        let buffer = Arc::new(LogBuffer::new(4096));
        let state = Arc::new(DurableState::new(0));
        let writer = Arc::new(
            LogWriter::open(&dir.path().join("redo.log"), Arc::clone(&buffer), state, &config)
                .unwrap(),
        );
        let flush_list = Arc::new(FlushList::new(0));
        let checkpointer =
            Checkpointer::new(dir.path(), Arc::clone(&flush_list), Arc::clone(&writer), None);

        // two commits; the first page stays dirty
        for (len, page) in [(40u64, 1u32), (60, 2)] {
            let mut reservation = buffer.reserve(len).unwrap();
            buffer
                .write_into(&mut reservation, &vec![0u8; len as usize])
                .unwrap();
            let range = buffer.close(reservation).unwrap();
            flush_list
                .insert_batch(range, &[PageId::new(0, page)], TIMEOUT)
                .unwrap();
        }

        let info = checkpointer.checkpoint().unwrap();
        assert_eq!(info.checkpoint_lsn, 0);
        assert_eq!(info.durable_lsn, 100);
        assert!(std::fs::metadata(dir.path().join("redo.log")).unwrap().len() > 0);

        flush_list.remove(PageId::new(0, 1)).unwrap();
        assert_eq!(checkpointer.checkpoint().unwrap().checkpoint_lsn, 40);

        flush_list.remove(PageId::new(0, 2)).unwrap();
        let info = checkpointer.checkpoint().unwrap();
        assert_eq!(info.checkpoint_lsn, 100);
        assert_eq!(checkpointer.last_checkpoint(), Some(info));
        // everything written is covered, so the file was emptied
        assert_eq!(std::fs::metadata(dir.path().join("redo.log")).unwrap().len(), 0);
    }
}
