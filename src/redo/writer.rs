//! Background log writer
//!
//! One dedicated thread drains closed log regions from the buffer, appends
//! them to the redo file as checksummed blocks and fsyncs them.
//!
//! ### Deferred fsync
//! Writing and syncing are decoupled:
//! - Closed bytes are written as soon as the writer is nudged or its tick fires
//! - Fsyncs happen every `fsync_interval_ms`, when `max_unfsynced_bytes`
//!   accumulate, or when someone asks for durability
//! - Each fsync publishes the durable LSN and wakes every waiting committer,
//!   so many commits share one fsync
//!
//! A failed write or fsync is fatal: the failure is published through
//! `DurableState`, the thread exits and later commits are refused.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{RedoError, Result};
use crate::types::Lsn;

use super::config::RedoConfig;
use super::log_buffer::LogBuffer;
use super::record::RedoBlock;
use super::waiter::DurableState;

/// Capacity of the writer's request channel
const WRITER_CHANNEL_SIZE: usize = 1024;

/// Destination of the redo stream
pub trait RedoSink: Send + 'static {
    fn append(&mut self, buf: &[u8]) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    /// Discard everything appended so far
    fn truncate(&mut self) -> io::Result<()>;
}

/// Append-only redo file
pub struct RedoFile {
    file: File,
    path: PathBuf,
}

impl RedoFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RedoSink for RedoFile {
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file.sync_all()?;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file.sync_all()?;
        // back to append mode for later blocks
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Frame one block and append it. Returns the bytes written.
pub(crate) fn write_block(sink: &mut dyn RedoSink, block: &RedoBlock) -> Result<u64> {
    let encoded = bincode::serialize(block)?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| RedoError::Internal(format!("redo block of {} bytes", encoded.len())))?;
    let mut framed = Vec::with_capacity(4 + encoded.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&encoded);
    sink.append(&framed)?;
    Ok(framed.len() as u64)
}

/// Requests understood by the writer thread
pub enum WriterMessage {
    /// New closed bytes are available; `sync` also asks for an fsync
    Flush { sync: bool },
    /// Write and fsync everything closed, reply with the durable LSN
    ForceSync(mpsc::SyncSender<Result<Lsn>>),
    /// Empty the redo file if nothing in it is above the LSN.
    /// Replies whether the file was truncated.
    Truncate(Lsn, mpsc::SyncSender<Result<bool>>),
    Shutdown,
}

/// Handle to the log writer thread
pub struct LogWriter {
    sender: mpsc::SyncSender<WriterMessage>,
    state: Arc<DurableState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    /// Start a writer appending to the file at `path`.
    pub fn open(
        path: &Path,
        log_buffer: Arc<LogBuffer>,
        state: Arc<DurableState>,
        config: &RedoConfig,
    ) -> Result<Self> {
        let file = RedoFile::open(path)?;
        Self::start(Box::new(file), log_buffer, state, config)
    }

    /// Start a writer on any sink. The writer begins draining at the
    /// buffer's reclaimed LSN.
    pub fn start(
        sink: Box<dyn RedoSink>,
        log_buffer: Arc<LogBuffer>,
        state: Arc<DurableState>,
        config: &RedoConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<WriterMessage>(WRITER_CHANNEL_SIZE);
        let written_lsn = log_buffer.reclaimed_lsn();
        let worker = WriterLoop {
            sink,
            log_buffer,
            state: Arc::clone(&state),
            written_lsn,
            unsynced_bytes: 0,
            last_sync: Instant::now(),
            tick: config.writer_tick(),
            fsync_interval: config.fsync_interval(),
            sync_every_batch: config.fsync_interval_ms == 0,
            max_unsynced_bytes: config.max_unfsynced_bytes,
            max_write_batch: config.max_write_batch,
        };

        let handle = thread::Builder::new()
            .name("redo-writer".to_string())
            .spawn(move || worker.run(rx))?;
        log::info!("Log writer started at LSN {}", written_lsn);

        Ok(Self {
            sender: tx,
            state,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> &Arc<DurableState> {
        &self.state
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.state.durable_lsn()
    }

    /// Tell the writer there is something to write. Never blocks.
    pub fn nudge(&self) {
        // a full channel already holds a wakeup
        let _ = self.sender.try_send(WriterMessage::Flush { sync: false });
    }

    /// Ask for an fsync without waiting for it.
    pub fn request_sync(&self) -> Result<()> {
        self.send(WriterMessage::Flush { sync: true })
    }

    /// Write and fsync everything closed so far; returns the durable LSN.
    pub fn force_sync(&self) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(WriterMessage::ForceSync(tx))?;
        rx.recv().map_err(|_| self.stopped_error())?
    }

    /// Truncate the redo file when every byte written is at or below
    /// `checkpoint_lsn`. Returns whether it happened.
    pub fn truncate(&self, checkpoint_lsn: Lsn) -> Result<bool> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(WriterMessage::Truncate(checkpoint_lsn, tx))?;
        rx.recv().map_err(|_| self.stopped_error())?
    }

    /// Drain, fsync and stop the thread. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .thread
            .lock()
            .map_err(|_| RedoError::Internal("writer handle mutex poisoned".to_string()))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = self.sender.send(WriterMessage::Shutdown);
        handle
            .join()
            .map_err(|_| RedoError::Internal("log writer thread panicked".to_string()))?;
        self.state.check_healthy()
    }

    fn send(&self, message: WriterMessage) -> Result<()> {
        self.sender.send(message).map_err(|_| self.stopped_error())
    }

    fn stopped_error(&self) -> RedoError {
        match self.state.check_healthy() {
            Err(e) => e,
            Ok(()) => RedoError::StorageIo("log writer is not running".to_string()),
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Log writer shutdown failed: {}", e);
        }
    }
}

/// Requests collected during one wakeup
#[derive(Default)]
struct Pending {
    sync: bool,
    force_syncs: Vec<mpsc::SyncSender<Result<Lsn>>>,
    truncates: Vec<(Lsn, mpsc::SyncSender<Result<bool>>)>,
    shutdown: bool,
    disconnected: bool,
}

impl Pending {
    fn absorb(&mut self, message: WriterMessage) {
        match message {
            WriterMessage::Flush { sync } => self.sync |= sync,
            WriterMessage::ForceSync(responder) => self.force_syncs.push(responder),
            WriterMessage::Truncate(lsn, responder) => self.truncates.push((lsn, responder)),
            WriterMessage::Shutdown => self.shutdown = true,
        }
    }

    fn fail(self, error: &RedoError) {
        let message = error.to_string();
        for responder in self.force_syncs {
            let _ = responder.send(Err(RedoError::StorageIo(message.clone())));
        }
        for (_, responder) in self.truncates {
            let _ = responder.send(Err(RedoError::StorageIo(message.clone())));
        }
    }
}

struct WriterLoop {
    sink: Box<dyn RedoSink>,
    log_buffer: Arc<LogBuffer>,
    state: Arc<DurableState>,
    /// Everything below this LSN is in the sink
    written_lsn: Lsn,
    unsynced_bytes: u64,
    last_sync: Instant,
    tick: Duration,
    fsync_interval: Duration,
    sync_every_batch: bool,
    max_unsynced_bytes: u64,
    max_write_batch: u64,
}

impl WriterLoop {
    fn run(mut self, rx: mpsc::Receiver<WriterMessage>) {
        loop {
            let pending = self.collect(&rx);
            let stop = pending.shutdown || pending.disconnected;

            match self.step(pending) {
                Ok(()) if stop => {
                    self.state.signal_shutdown();
                    log::info!("Log writer stopped at LSN {}", self.written_lsn);
                    break;
                }
                Ok(()) => {}
                Err(e) => {
                    log::error!("Log writer failed at LSN {}: {}", self.written_lsn, e);
                    self.state.signal_failure(e.to_string());
                    break;
                }
            }
        }
    }

    /// Wait for the first request (or the tick), then take whatever else is queued.
    fn collect(&self, rx: &mpsc::Receiver<WriterMessage>) -> Pending {
        let mut pending = Pending::default();
        let timeout = if self.unsynced_bytes > 0 && !self.sync_every_batch {
            self.tick
                .min(self.fsync_interval.saturating_sub(self.last_sync.elapsed()))
        } else {
            self.tick
        };

        match rx.recv_timeout(timeout) {
            Ok(message) => pending.absorb(message),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                pending.disconnected = true;
                return pending;
            }
        }
        while !pending.shutdown {
            match rx.try_recv() {
                Ok(message) => pending.absorb(message),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    pending.disconnected = true;
                    break;
                }
            }
        }
        pending
    }

    fn step(&mut self, pending: Pending) -> Result<()> {
        let written = match self.drain() {
            Ok(written) => written,
            Err(e) => {
                pending.fail(&e);
                return Err(e);
            }
        };

        let time_triggered = self.last_sync.elapsed() >= self.fsync_interval;
        let size_triggered = self.unsynced_bytes >= self.max_unsynced_bytes;
        let requested = pending.sync || !pending.force_syncs.is_empty() || !pending.truncates.is_empty();
        let stopping = pending.shutdown || pending.disconnected;

        if self.unsynced_bytes > 0
            && (self.sync_every_batch || time_triggered || size_triggered || requested || stopping)
        {
            if let Err(e) = self.sync() {
                pending.fail(&e);
                return Err(e);
            }
            log::debug!(
                "Redo fsync complete: LSN {} (trigger: {})",
                self.written_lsn,
                if requested {
                    "request"
                } else if stopping {
                    "shutdown"
                } else if size_triggered {
                    "size"
                } else if self.sync_every_batch {
                    "batch"
                } else {
                    "time"
                }
            );
        } else if written > 0 {
            log::trace!("Redo written without fsync: {} bytes", written);
        }

        let durable = self.state.durable_lsn();
        for responder in pending.force_syncs {
            let _ = responder.send(Ok(durable));
        }

        for (checkpoint_lsn, responder) in pending.truncates {
            let result = self.truncate(checkpoint_lsn);
            if let Err(e) = &result {
                let _ = responder.send(Err(RedoError::StorageIo(e.to_string())));
                return result.map(|_| ());
            }
            let _ = responder.send(result);
        }
        Ok(())
    }

    /// Write every closed byte to the sink. Returns the bytes drained.
    fn drain(&mut self) -> Result<u64> {
        let mut drained = 0;
        while let Some((range, data)) = self
            .log_buffer
            .read_closed_from(self.written_lsn, self.max_write_batch)?
        {
            let block = RedoBlock::new(range.start, data);
            let bytes = write_block(self.sink.as_mut(), &block)
                .map_err(|e| RedoError::StorageIo(format!("redo write failed: {}", e)))?;

            self.written_lsn = range.end;
            self.unsynced_bytes += bytes;
            drained += range.len();
            self.state.update_written(range.end);
            // the file holds the bytes now; the buffer space can be reused
            self.log_buffer.reclaim(range.end)?;
        }
        if drained > 0 {
            log::debug!("Redo batch written: {} bytes, up to LSN {}", drained, self.written_lsn);
        }
        Ok(drained)
    }

    fn sync(&mut self) -> Result<()> {
        self.sink
            .sync()
            .map_err(|e| RedoError::StorageIo(format!("redo fsync failed: {}", e)))?;
        self.unsynced_bytes = 0;
        self.last_sync = Instant::now();
        self.state.signal_durable(self.written_lsn);
        Ok(())
    }

    fn truncate(&mut self, checkpoint_lsn: Lsn) -> Result<bool> {
        if self.written_lsn > checkpoint_lsn || self.unsynced_bytes > 0 {
            return Ok(false);
        }
        self.sink
            .truncate()
            .map_err(|e| RedoError::StorageIo(format!("redo truncate failed: {}", e)))?;
        log::info!("Redo file truncated at checkpoint LSN {}", checkpoint_lsn);
        Ok(true)
    }
}
