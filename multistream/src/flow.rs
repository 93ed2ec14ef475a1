//! Flow: one priority lane of a unit
//!
//! A flow couples a [`ChunkStore`] with the [`Gate`] that guards it and
//! implements the read and write protocol on top of them:
//!
//! 1. Take the gate lock, non-blocking or with the session timeout.
//! 2. If the resource (free space for writers, data for readers) is missing
//!    and the session blocks, release the lock, wait for the resource, and
//!    take the lock again.
//! 3. Re-check the resource under the lock; the state may have changed.
//! 4. Clip the request, transfer, update the levels, release and notify.
//!
//! High-priority writes append directly. Low-priority writes only reserve
//! the space and hand the bytes to the [`DeferredWriter`]; they become
//! readable when the worker has appended them.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gate::{Gate, GateGuard, Interrupt, WaitError, WaitFor};
use crate::io::ChunkStore;
use crate::scheduler::DeferredWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    High,
}

impl Priority {
    pub const ALL: [Priority; 2] = [Priority::Low, Priority::High];

    /// Decode the control-surface value: 0 is low, 1 is high
    #[must_use]
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.pad("low"),
            Self::High => f.pad("high"),
        }
    }
}

/// How an operation behaves when it cannot proceed at once
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy<'a> {
    /// Zero means non-blocking
    pub timeout: Duration,
    pub interrupt: &'a Interrupt,
}

impl<'a> WaitPolicy<'a> {
    #[must_use]
    pub fn new(timeout: Duration, interrupt: &'a Interrupt) -> Self {
        Self { timeout, interrupt }
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !self.timeout.is_zero()
    }
}

#[derive(Debug, Default)]
struct FlowCounters {
    chunks: AtomicUsize,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    deferred_pending: AtomicUsize,
    deferred_failed: AtomicU64,
}

/// Point-in-time view of a flow, read without taking its lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowStats {
    /// Readable bytes
    pub buffered_bytes: usize,
    /// Bytes that can still be accepted, deferred reservations excluded
    pub free_bytes: usize,
    /// Threads waiting for space or data
    pub waiting: usize,
    /// Chunks linked into the store
    pub chunks: usize,
    pub bytes_written: u64,
    pub bytes_read: u64,
    /// Deferred writes accepted but not yet appended
    pub deferred_pending: usize,
    /// Deferred writes whose append failed
    pub deferred_failed: u64,
}

pub struct Flow {
    unit: usize,
    priority: Priority,
    gate: Gate<ChunkStore>,
    counters: FlowCounters,
}

impl Flow {
    /// Create an empty flow with its first chunk allocated
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the first chunk cannot be allocated.
    pub fn new(unit: usize, priority: Priority, config: &Config) -> Result<Self> {
        let store = ChunkStore::with_first_chunk(config.chunk_size)?;
        Ok(Self::with_store(unit, priority, store, config.capacity()))
    }

    fn with_store(unit: usize, priority: Priority, store: ChunkStore, capacity: usize) -> Self {
        let counters = FlowCounters::default();
        counters.chunks.store(store.live_chunks(), Ordering::Relaxed);
        Self {
            unit,
            priority,
            gate: Gate::new(format!("unit{unit}.{priority}"), store, capacity),
            counters,
        }
    }

    #[must_use]
    pub fn unit(&self) -> usize {
        self.unit
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn gate(&self) -> &Gate<ChunkStore> {
        &self.gate
    }

    #[must_use]
    pub fn stats(&self) -> FlowStats {
        FlowStats {
            buffered_bytes: self.gate.valid_bytes(),
            free_bytes: self.gate.free_bytes(),
            waiting: self.gate.waiting(),
            chunks: self.counters.chunks.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            deferred_pending: self.counters.deferred_pending.load(Ordering::Acquire),
            deferred_failed: self.counters.deferred_failed.load(Ordering::Relaxed),
        }
    }

    /// Take the flow lock according to `wait`
    ///
    /// # Errors
    ///
    /// [`Error::LockUnavailable`] when non-blocking and the lock is taken,
    /// [`Error::Timeout`] or [`Error::Interrupted`] when blocking.
    pub fn lock(&self, wait: &WaitPolicy<'_>) -> Result<GateGuard<'_, ChunkStore>> {
        if !wait.is_blocking() {
            return self.gate.try_acquire().ok_or(Error::LockUnavailable);
        }
        self.gate
            .acquire_blocking(wait.timeout, wait.interrupt)
            .map_err(|e| match e {
                WaitError::TimedOut => Error::Timeout,
                WaitError::Interrupted => Error::Interrupted,
            })
    }

    /// Write up to `bytes.len()` bytes, clipped to the free space.
    ///
    /// Returns the number of bytes accepted. For the low-priority flow the
    /// bytes are accepted once reserved and queued, not once stored.
    ///
    /// # Errors
    ///
    /// Lock errors as in [`Flow::lock`]; [`Error::NoSpace`] if the flow stays
    /// full; [`Error::OutOfMemory`] or [`Error::ShutDown`] if the bytes cannot
    /// be stored or queued.
    pub fn write(
        self: &Arc<Self>,
        bytes: &[u8],
        wait: &WaitPolicy<'_>,
        deferred: &DeferredWriter,
    ) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let mut guard = self.lock(wait)?;
        if guard.free_bytes() == 0 && wait.is_blocking() {
            guard.release_and_notify();
            log::debug!("flow.write: {} full, waiting for space", self.gate.name());
            self.gate
                .wait_until_ready(WaitFor::Space, wait.timeout, wait.interrupt)
                .map_err(|e| match e {
                    WaitError::TimedOut => Error::NoSpace,
                    WaitError::Interrupted => Error::Interrupted,
                })?;
            guard = self.lock(wait)?;
        }

        let free = guard.free_bytes();
        if free == 0 {
            return Err(Error::NoSpace);
        }
        let accepted = &bytes[..bytes.len().min(free)];

        match self.priority {
            Priority::High => {
                let n = guard.append(accepted)?;
                guard.reserve(n);
                guard.publish(n);
                self.counters
                    .chunks
                    .store(guard.live_chunks(), Ordering::Relaxed);
                self.counters
                    .bytes_written
                    .fetch_add(n as u64, Ordering::Relaxed);
                log::trace!("flow.write: {} stored {n} bytes", self.gate.name());
                Ok(n)
            }
            Priority::Low => {
                deferred.submit(self, &mut guard, accepted)?;
                log::trace!(
                    "flow.write: {} deferred {} bytes",
                    self.gate.name(),
                    accepted.len()
                );
                Ok(accepted.len())
            }
        }
    }

    /// Read up to `max_len` bytes in FIFO order.
    ///
    /// A non-blocking read of an empty flow returns an empty buffer.
    ///
    /// # Errors
    ///
    /// Lock errors as in [`Flow::lock`]; [`Error::NoData`] if a blocking read
    /// finds no data within the timeout; [`Error::OutOfMemory`] if the output
    /// buffer cannot be allocated.
    pub fn read(&self, max_len: usize, wait: &WaitPolicy<'_>) -> Result<Vec<u8>> {
        if max_len == 0 {
            return Ok(Vec::new());
        }

        let mut guard = self.lock(wait)?;
        if guard.valid_bytes() == 0 {
            if !wait.is_blocking() {
                return Ok(Vec::new());
            }
            guard.release_and_notify();
            log::debug!("flow.read: {} empty, waiting for data", self.gate.name());
            self.gate
                .wait_until_ready(WaitFor::Data, wait.timeout, wait.interrupt)
                .map_err(|e| match e {
                    WaitError::TimedOut => Error::NoData,
                    WaitError::Interrupted => Error::Interrupted,
                })?;
            guard = self.lock(wait)?;
            if guard.valid_bytes() == 0 {
                return Err(Error::NoData);
            }
        }

        let len = max_len.min(guard.valid_bytes());
        let out = guard.consume(len)?;
        guard.retire(out.len());
        self.counters
            .chunks
            .store(guard.live_chunks(), Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        log::trace!("flow.read: {} returned {} bytes", self.gate.name(), out.len());
        Ok(out)
    }

    pub(crate) fn deferred_queued(&self) {
        self.counters.deferred_pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Append a deferred write whose space was reserved at submission.
    ///
    /// Runs on the deferred worker. If the append fails the reservation is
    /// returned to the free space and the failure is counted.
    pub(crate) fn complete_deferred(&self, data: &[u8]) {
        let mut guard = self.gate.acquire();
        match guard.append(data) {
            Ok(n) => {
                guard.publish(n);
                self.counters
                    .bytes_written
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                guard.unreserve(data.len());
                self.counters.deferred_failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "flow.deferred: {} dropped {} bytes: {e}",
                    self.gate.name(),
                    data.len()
                );
            }
        }
        self.counters
            .chunks
            .store(guard.live_chunks(), Ordering::Relaxed);
        self.counters.deferred_pending.fetch_sub(1, Ordering::AcqRel);
        guard.release_and_notify();
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("gate", &self.gate)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            units: 1,
            chunk_size: 8,
            max_chunks: 3,
            ..Config::default()
        }
    }

    #[test]
    fn test_priority_from_raw() {
        assert_eq!(Priority::from_raw(0), Some(Priority::Low));
        assert_eq!(Priority::from_raw(1), Some(Priority::High));
        assert_eq!(Priority::from_raw(2), None);
        assert_eq!(Priority::High.to_string(), "high");
    }

    #[test]
    fn test_high_write_then_read() {
        let flow = Arc::new(Flow::new(0, Priority::High, &small_config()).unwrap());
        let deferred = DeferredWriter::start(4).unwrap();
        let interrupt = Interrupt::new();
        let wait = WaitPolicy::new(Duration::ZERO, &interrupt);

        assert_eq!(flow.write(b"0123456789", &wait, &deferred).unwrap(), 10);
        assert_eq!(flow.stats().chunks, 2);
        assert_eq!(flow.read(4, &wait).unwrap(), b"0123");
        assert_eq!(flow.read(100, &wait).unwrap(), b"456789");
        assert_eq!(flow.stats().chunks, 1);
        deferred.shutdown();
    }

    #[test]
    fn test_non_blocking_lock_contention() {
        let flow = Flow::new(0, Priority::High, &small_config()).unwrap();
        let interrupt = Interrupt::new();
        let wait = WaitPolicy::new(Duration::ZERO, &interrupt);

        let _held = flow.gate().acquire();
        assert_eq!(flow.read(1, &wait).unwrap_err(), Error::LockUnavailable);
    }

    #[test]
    fn test_blocking_lock_times_out() {
        let flow = Flow::new(0, Priority::High, &small_config()).unwrap();
        let interrupt = Interrupt::new();
        let wait = WaitPolicy::new(Duration::from_millis(20), &interrupt);

        let _held = flow.gate().acquire();
        assert_eq!(flow.read(1, &wait).unwrap_err(), Error::Timeout);
    }

    #[test]
    fn test_failed_deferred_append_returns_space() {
        // Chunks this large can never be allocated
        let store = ChunkStore::new(usize::MAX / 2 + 1).unwrap();
        let flow = Arc::new(Flow::with_store(0, Priority::Low, store, 100));
        let deferred = DeferredWriter::start(4).unwrap();
        let interrupt = Interrupt::new();
        let wait = WaitPolicy::new(Duration::from_secs(5), &interrupt);

        assert_eq!(flow.write(b"lost bytes", &wait, &deferred).unwrap(), 10);
        deferred.flush();

        let stats = flow.stats();
        assert_eq!(stats.free_bytes, 100);
        assert_eq!(stats.buffered_bytes, 0);
        assert_eq!(stats.deferred_failed, 1);
        assert_eq!(stats.deferred_pending, 0);
        assert_eq!(stats.bytes_written, 0);

        // The returned space is usable again
        assert_eq!(flow.write(&[0; 100], &wait, &deferred).unwrap(), 100);
        deferred.shutdown();
    }
}
