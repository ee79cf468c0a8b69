//! Redo file scanning on startup
//!
//! The scanner reads the redo file block by block, checks each block's
//! checksum and that its LSN continues where the previous block ended, and
//! stops at the first block that fails either test. A crash in the middle of
//! an append leaves exactly such a torn tail; it is cut off before the writer
//! starts appending again. Parsing the recovered redo into page changes is
//! left to the record codec.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::Lsn;

use super::checkpoint::{CheckpointInfo, CHECKPOINT_FILE};
use super::record::RedoBlock;

pub const REDO_FILE: &str = "redo.log";

/// What the scan found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLog {
    pub checkpoint: Option<CheckpointInfo>,
    /// LSN of the first byte in the redo file
    pub start_lsn: Lsn,
    /// LSN just past the last valid block
    pub end_lsn: Lsn,
    pub blocks: usize,
    /// Length of the valid prefix of the file
    pub valid_len: u64,
    /// Bytes after the valid prefix were discarded
    pub torn_tail: bool,
    /// LSN of the first byte of `redo`
    pub redo_start_lsn: Lsn,
    /// Redo above the checkpoint, contiguous
    pub redo: Vec<u8>,
}

impl RecoveredLog {
    fn empty(checkpoint: Option<CheckpointInfo>) -> Self {
        let lsn = checkpoint.map_or(0, |c| c.checkpoint_lsn);
        Self {
            checkpoint,
            start_lsn: lsn,
            end_lsn: lsn,
            blocks: 0,
            valid_len: 0,
            torn_tail: false,
            redo_start_lsn: lsn,
            redo: Vec::new(),
        }
    }

    pub fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint.map_or(0, |c| c.checkpoint_lsn)
    }

    /// First LSN new redo may use
    pub fn resume_lsn(&self) -> Lsn {
        self.end_lsn.max(self.checkpoint_lsn())
    }
}

pub struct RedoScanner {
    data_dir: PathBuf,
}

impl RedoScanner {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn redo_path(&self) -> PathBuf {
        self.data_dir.join(REDO_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    pub fn scan(&self) -> Result<RecoveredLog> {
        let checkpoint = CheckpointInfo::load(&self.checkpoint_path())?;
        let mut recovered = RecoveredLog::empty(checkpoint);

        let path = self.redo_path();
        if !path.exists() {
            return Ok(recovered);
        }
        let bytes = fs::read(&path)?;
        if bytes.is_empty() {
            return Ok(recovered);
        }

        log::info!("Scanning redo file ({} bytes)...", bytes.len());
        if let Some(info) = checkpoint {
            log::info!("Found checkpoint at LSN {}", info.checkpoint_lsn);
        }

        let checkpoint_lsn = recovered.checkpoint_lsn();
        let mut offset = 0usize;
        let mut expected: Option<Lsn> = None;

        while offset < bytes.len() {
            let block = match decode_block(&bytes[offset..]) {
                Some((block, consumed)) => {
                    if !block.verify() {
                        log::warn!("Redo block at LSN {} fails its checksum", block.start_lsn);
                        break;
                    }
                    if expected.map_or(false, |lsn| lsn != block.start_lsn) {
                        log::warn!(
                            "Redo block at LSN {} does not continue LSN {}",
                            block.start_lsn,
                            expected.unwrap_or_default()
                        );
                        break;
                    }
                    offset += consumed;
                    block
                }
                None => break,
            };

            let range = block.range();
            if recovered.blocks == 0 {
                recovered.start_lsn = range.start;
                recovered.redo_start_lsn = range.start.max(checkpoint_lsn);
            }
            if range.end > checkpoint_lsn {
                let skip = checkpoint_lsn.saturating_sub(range.start) as usize;
                recovered.redo.extend_from_slice(&block.data[skip..]);
            }
            recovered.blocks += 1;
            recovered.end_lsn = range.end;
            expected = Some(range.end);
        }

        recovered.valid_len = offset as u64;
        if offset < bytes.len() {
            recovered.torn_tail = true;
            log::warn!(
                "Torn redo tail: discarding {} bytes after LSN {}",
                bytes.len() - offset,
                recovered.end_lsn
            );
        }
        if recovered.blocks > 0 && recovered.end_lsn < checkpoint_lsn {
            // the file predates the checkpoint entirely
            recovered.redo_start_lsn = checkpoint_lsn;
        }

        log::info!(
            "Redo scan complete: {} blocks, LSN {} to {}, {} bytes above checkpoint",
            recovered.blocks,
            recovered.start_lsn,
            recovered.end_lsn,
            recovered.redo.len()
        );
        Ok(recovered)
    }

    /// Cut the file back to its valid prefix.
    pub fn repair(&self, recovered: &RecoveredLog) -> Result<()> {
        if !recovered.torn_tail {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(self.redo_path())?;
        file.set_len(recovered.valid_len)?;
        file.sync_all()?;
        log::info!("Redo file cut back to {} bytes", recovered.valid_len);
        Ok(())
    }
}

/// Decode one length-prefixed block. `None` when the bytes end early or do
/// not decode.
fn decode_block(bytes: &[u8]) -> Option<(RedoBlock, usize)> {
    let prefix: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(prefix) as usize;
    let body = bytes.get(4..4 + len)?;
    match bincode::deserialize::<RedoBlock>(body) {
        Ok(block) => Some((block, 4 + len)),
        Err(e) => {
            log::warn!("Malformed redo block: {}", e);
            None
        }
    }
}
