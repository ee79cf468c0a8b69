//! Durable-LSN tracking and commit backpressure
//!
//! The log writer is the only thread that moves the durable LSN. Committing
//! threads block on the condition it signals, either to wait for a specific
//! LSN (`flush_up_to`) or to let the closed-but-not-durable backlog shrink
//! (`wait_until_closed_below`). Every wait is bounded: a stalled writer turns
//! into a warning or a timeout error, never a hang.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{RedoError, Result};
use crate::types::Lsn;

use super::log_buffer::LogBuffer;

/// State shared between the log writer and waiting committers
pub struct DurableState {
    /// Highest LSN fsynced to disk
    durable_lsn: AtomicU64,
    /// Highest LSN written to the file (maybe not fsynced)
    written_lsn: AtomicU64,
    condvar: Condvar,
    /// Mutex paired with the condvar; also holds the writer's failure message
    failure: Mutex<Option<String>>,
    failed: AtomicBool,
    shutdown: AtomicBool,
}

impl DurableState {
    pub fn new(start_lsn: Lsn) -> Self {
        Self {
            durable_lsn: AtomicU64::new(start_lsn),
            written_lsn: AtomicU64::new(start_lsn),
            condvar: Condvar::new(),
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn written_lsn(&self) -> Lsn {
        self.written_lsn.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// `StorageIo` once the writer has failed; commits must stop.
    pub fn check_healthy(&self) -> Result<()> {
        if !self.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        let message = self
            .lock()?
            .clone()
            .unwrap_or_else(|| "log writer failed".to_string());
        Err(RedoError::StorageIo(message))
    }

    /// Advance the durable LSN (never moves backwards) and wake all waiters.
    pub(crate) fn signal_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        self.notify();
    }

    pub(crate) fn update_written(&self, lsn: Lsn) {
        self.written_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    pub(crate) fn signal_failure(&self, message: String) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(message);
        }
        self.failed.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify();
    }

    fn notify(&self) {
        // take the lock so a waiter between its check and its wait cannot miss us
        drop(self.failure.lock());
        self.condvar.notify_all();
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<String>>> {
        self.failure
            .lock()
            .map_err(|_| RedoError::Internal("durable state mutex poisoned".to_string()))
    }

    /// Block until `done()` holds, the writer fails, or `deadline` passes.
    /// Returns whether `done()` held.
    fn wait_while(&self, deadline: Instant, mut done: impl FnMut() -> bool) -> Result<bool> {
        let mut guard = self.lock()?;
        loop {
            if done() {
                return Ok(true);
            }
            if let Some(message) = guard.as_ref() {
                return Err(RedoError::StorageIo(message.clone()));
            }
            if self.is_shutdown() {
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| RedoError::Internal("durable state condvar wait failed".to_string()))?
                .0;
        }
    }

    /// Wait until `target` is durable.
    pub fn wait_for_durable(&self, target: Lsn, timeout: Duration) -> Result<()> {
        // Fast path: already durable
        if self.durable_lsn() >= target {
            return Ok(());
        }
        let started = Instant::now();
        if self.wait_while(started + timeout, || self.durable_lsn() >= target)? {
            return Ok(());
        }
        Err(RedoError::DurabilityTimeout {
            target,
            current: self.durable_lsn(),
            waited: started.elapsed(),
        })
    }
}

/// Result of a backpressure wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Backlog was already below the threshold
    Immediate,
    /// Backlog dropped below the threshold after waiting
    Satisfied,
    /// Gave up after the maximum wait; commit proceeds anyway
    TimedOut { backlog: u64 },
    /// Writer stopped while we waited
    WriterStopped,
}

/// Bounds the volume of closed-but-not-durable log
#[derive(Clone)]
pub struct DurabilityWaiter {
    log_buffer: Arc<LogBuffer>,
    state: Arc<DurableState>,
}

impl DurabilityWaiter {
    pub fn new(log_buffer: Arc<LogBuffer>, state: Arc<DurableState>) -> Self {
        Self { log_buffer, state }
    }

    pub fn state(&self) -> &Arc<DurableState> {
        &self.state
    }

    /// Closed bytes not yet durable
    pub fn backlog(&self) -> u64 {
        self.log_buffer
            .closed_lsn()
            .saturating_sub(self.state.durable_lsn())
    }

    /// Suspend the caller until the backlog is below `threshold`.
    ///
    /// After `max_wait` the wait gives up with a warning; only a failed
    /// writer is an error.
    pub fn wait_until_closed_below(&self, threshold: u64, max_wait: Duration) -> Result<WaitOutcome> {
        if self.backlog() < threshold {
            return Ok(WaitOutcome::Immediate);
        }

        let started = Instant::now();
        if self
            .state
            .wait_while(started + max_wait, || self.backlog() < threshold)?
        {
            return Ok(WaitOutcome::Satisfied);
        }
        if self.state.is_shutdown() {
            return Ok(WaitOutcome::WriterStopped);
        }

        let backlog = self.backlog();
        let timeout = RedoError::DurabilityTimeout {
            target: self.log_buffer.closed_lsn().saturating_sub(threshold),
            current: self.state.durable_lsn(),
            waited: started.elapsed(),
        };
        log::warn!(
            "{}; proceeding with {} closed bytes not durable (threshold {})",
            timeout,
            backlog,
            threshold
        );
        Ok(WaitOutcome::TimedOut { backlog })
    }

    pub fn wait_for_durable(&self, target: Lsn, timeout: Duration) -> Result<()> {
        self.state.wait_for_durable(target, timeout)
    }
}
