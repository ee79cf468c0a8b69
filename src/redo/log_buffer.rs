//! In-memory redo log buffer
//!
//! A fixed-capacity circular byte region holding the tail of the redo log.
//! Committing threads reserve disjoint LSN ranges with a single CAS on the
//! tail cursor and then copy their records in parallel; no lock is taken on
//! the copy path.
//!
//! Three cursors describe the buffer, always ordered
//! `reclaimed_lsn <= closed_lsn <= tail_lsn`:
//!
//! ```text
//!   reclaimed            closed                tail
//!       |  closed, not yet  |  reserved, being   |  free
//!       |  drained          |  copied (may close |
//!       |                   |  out of order)     |
//! ```
//!
//! - **tail**: next LSN handed out by `reserve`
//! - **closed**: every byte below it is fully copied; the writer may drain it
//! - **reclaimed**: every byte below it has been written out; its space is free
//!
//! `tail - reclaimed` never exceeds the capacity, so every live LSN maps to a
//! distinct physical byte.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{RedoError, Result};
use crate::types::{Lsn, LsnRange};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An exclusively owned, not yet closed range of the log buffer.
///
/// Must be written completely and handed back to [`LogBuffer::close`];
/// an abandoned reservation stalls the closed LSN forever.
#[must_use = "a reservation must be written and closed"]
#[derive(Debug)]
pub struct Reservation {
    buffer_id: u64,
    range: LsnRange,
    cursor: Lsn,
}

impl Reservation {
    pub fn range(&self) -> LsnRange {
        self.range
    }

    pub fn start_lsn(&self) -> Lsn {
        self.range.start
    }

    pub fn end_lsn(&self) -> Lsn {
        self.range.end
    }

    /// Bytes still to be written before the range can close
    pub fn remaining(&self) -> u64 {
        self.range.end - self.cursor
    }
}

#[derive(Debug)]
struct ClosedState {
    closed_lsn: Lsn,
    /// Ranges closed ahead of `closed_lsn`: start -> end
    pending: BTreeMap<Lsn, Lsn>,
}

pub struct LogBuffer {
    id: u64,
    data: Box<[UnsafeCell<u8>]>,
    capacity: u64,
    tail: AtomicU64,
    /// Lock-free mirror of `closed.closed_lsn`
    closed_lsn: AtomicU64,
    reclaimed: AtomicU64,
    closed: Mutex<ClosedState>,
}

// SAFETY: the byte region is only written through a `Reservation`, which is
// unique (not Clone) and covers a range no other live reservation maps onto
// (the capacity check in `reserve`). Reads only touch closed bytes, which no
// reservation writes again until `reclaim` moves past them, and `reclaim`
// and `read` serialize on the `closed` mutex.
unsafe impl Sync for LogBuffer {}

impl LogBuffer {
    pub fn new(capacity: u64) -> Self {
        Self::with_start_lsn(capacity, 0)
    }

    /// Create a buffer whose first reservation starts at `start_lsn`
    /// (used after recovery to continue the LSN sequence).
    pub fn with_start_lsn(capacity: u64, start_lsn: Lsn) -> Self {
        let data: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data,
            capacity,
            tail: AtomicU64::new(start_lsn),
            closed_lsn: AtomicU64::new(start_lsn),
            reclaimed: AtomicU64::new(start_lsn),
            closed: Mutex::new(ClosedState {
                closed_lsn: start_lsn,
                pending: BTreeMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Next LSN to be reserved
    pub fn tail_lsn(&self) -> Lsn {
        self.tail.load(Ordering::Acquire)
    }

    /// Every byte below this LSN is fully copied into the buffer
    pub fn closed_lsn(&self) -> Lsn {
        self.closed_lsn.load(Ordering::Acquire)
    }

    /// Every byte below this LSN has been drained and its space is free
    pub fn reclaimed_lsn(&self) -> Lsn {
        self.reclaimed.load(Ordering::Acquire)
    }

    /// Free bytes right now (may be stale by the time it is used)
    pub fn available(&self) -> u64 {
        let used = self.tail_lsn().saturating_sub(self.reclaimed_lsn());
        self.capacity.saturating_sub(used)
    }

    /// Reserve `len` bytes at the tail.
    ///
    /// Never blocks. Returns `BufferExhausted` while the writer still has to
    /// drain older bytes, and `CommitFailed` if `len` can never fit.
    pub fn reserve(&self, len: u64) -> Result<Reservation> {
        if len == 0 {
            return Err(RedoError::Internal("zero-length log reservation".to_string()));
        }
        if len > self.capacity {
            return Err(RedoError::CommitFailed(format!(
                "{} bytes of redo can never fit in a {} byte log buffer",
                len, self.capacity
            )));
        }

        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let end = tail.checked_add(len).ok_or(RedoError::LsnExhausted {
                tail,
                requested: len,
            })?;
            let reclaimed = self.reclaimed.load(Ordering::Acquire);
            if end - reclaimed > self.capacity {
                return Err(RedoError::BufferExhausted {
                    requested: len,
                    available: self.capacity.saturating_sub(tail - reclaimed),
                });
            }
            match self
                .tail
                .compare_exchange_weak(tail, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Ok(Reservation {
                        buffer_id: self.id,
                        range: LsnRange::new(tail, end),
                        cursor: tail,
                    })
                }
                Err(current) => tail = current,
            }
        }
    }

    /// Append `data` to a reservation at its write cursor.
    pub fn write_into(&self, reservation: &mut Reservation, data: &[u8]) -> Result<()> {
        self.check_owner(reservation)?;
        let len = data.len() as u64;
        if len > reservation.remaining() {
            return Err(RedoError::OrderingViolation(format!(
                "write of {} bytes overruns reservation {} at LSN {}",
                len, reservation.range, reservation.cursor
            )));
        }
        // SAFETY: [cursor, cursor + len) lies inside the caller's reservation,
        // which no other thread can write or reclaim until it is closed.
        unsafe { self.copy_in(reservation.cursor, data) };
        reservation.cursor += len;
        Ok(())
    }

    /// Mark a fully written reservation as closed and advance the closed LSN
    /// over every contiguous closed range.
    pub fn close(&self, reservation: Reservation) -> Result<LsnRange> {
        self.check_owner(&reservation)?;
        let range = reservation.range;
        if reservation.remaining() != 0 {
            return Err(RedoError::OrderingViolation(format!(
                "closing reservation {} with {} bytes unwritten",
                range,
                reservation.remaining()
            )));
        }

        let mut guard = self.lock_closed()?;
        let state = &mut *guard;
        if range.start < state.closed_lsn || state.pending.contains_key(&range.start) {
            return Err(RedoError::OrderingViolation(format!(
                "range {} closed twice (closed LSN {})",
                range, state.closed_lsn
            )));
        }
        state.pending.insert(range.start, range.end);
        while let Some(end) = state.pending.remove(&state.closed_lsn) {
            state.closed_lsn = end;
        }
        self.closed_lsn.store(state.closed_lsn, Ordering::Release);
        Ok(range)
    }

    /// Copy a closed range that is still resident in the buffer.
    pub fn read(&self, range: LsnRange) -> Result<Vec<u8>> {
        // holding the lock keeps `reclaim` from releasing the bytes mid-copy
        let guard = self.lock_closed()?;
        let reclaimed = self.reclaimed_lsn();
        if range.start > range.end || range.start < reclaimed || range.end > guard.closed_lsn {
            return Err(RedoError::Internal(format!(
                "range {} is not resident (reclaimed {}, closed {})",
                range, reclaimed, guard.closed_lsn
            )));
        }
        // SAFETY: closed and not reclaimed; nobody writes these bytes now.
        let bytes = unsafe { self.copy_out(range.start, range.len()) };
        drop(guard);
        Ok(bytes)
    }

    /// Drain interface: up to `max_len` closed bytes starting at `from`.
    ///
    /// Returns `None` when nothing closed lies at or after `from`.
    pub fn read_closed_from(&self, from: Lsn, max_len: u64) -> Result<Option<(LsnRange, Vec<u8>)>> {
        let closed = self.closed_lsn();
        if from >= closed {
            return Ok(None);
        }
        let end = closed.min(from.saturating_add(max_len));
        self.read(LsnRange::new(from, end)).map(|bytes| Some((LsnRange::new(from, end), bytes)))
    }

    /// Release buffer space below `up_to` once it has been written out.
    pub fn reclaim(&self, up_to: Lsn) -> Result<()> {
        let guard = self.lock_closed()?;
        let reclaimed = self.reclaimed_lsn();
        if up_to < reclaimed || up_to > guard.closed_lsn {
            return Err(RedoError::OrderingViolation(format!(
                "reclaim to {} outside [{}, {}]",
                up_to, reclaimed, guard.closed_lsn
            )));
        }
        self.reclaimed.store(up_to, Ordering::Release);
        Ok(())
    }

    fn check_owner(&self, reservation: &Reservation) -> Result<()> {
        if reservation.buffer_id != self.id {
            return Err(RedoError::OrderingViolation(format!(
                "reservation {} belongs to another log buffer",
                reservation.range
            )));
        }
        Ok(())
    }

    fn lock_closed(&self) -> Result<MutexGuard<'_, ClosedState>> {
        self.closed
            .lock()
            .map_err(|_| RedoError::Internal("log buffer close mutex poisoned".to_string()))
    }

    fn offset(&self, lsn: Lsn) -> usize {
        (lsn % self.capacity) as usize
    }

    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    /// # Safety
    /// The caller must own `[lsn, lsn + data.len())` exclusively.
    unsafe fn copy_in(&self, lsn: Lsn, data: &[u8]) {
        let offset = self.offset(lsn);
        let first = data.len().min(self.capacity as usize - offset);
        let base = self.base_ptr();
        ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), first);
        if first < data.len() {
            ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
        }
    }

    /// # Safety
    /// `[lsn, lsn + len)` must be closed and not reclaimed.
    unsafe fn copy_out(&self, lsn: Lsn, len: u64) -> Vec<u8> {
        let len = len as usize;
        let mut out = vec![0u8; len];
        let offset = self.offset(lsn);
        let first = len.min(self.capacity as usize - offset);
        let base = self.base_ptr();
        ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), first);
        if first < len {
            ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), len - first);
        }
        out
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("capacity", &self.capacity)
            .field("tail", &self.tail_lsn())
            .field("closed", &self.closed_lsn())
            .field("reclaimed", &self.reclaimed_lsn())
            .finish()
    }
}
