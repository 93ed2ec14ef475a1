//! Flow gate
//!
//! A gate is the mutual-exclusion lock of one flow together with the list of
//! threads parked on it. A thread parks for one of three reasons
//! ([`WaitFor`]): the lock itself, free space, or buffered data. Every release
//! of the lock wakes at most one parked thread, and only one whose reason can
//! make progress right now. A parked thread leaves when it is woken, when its
//! deadline passes, or when its session's [`Interrupt`] fires; the three
//! outcomes are distinct.
//!
//! The gate also carries the byte levels of the flow (`valid` and `free`).
//! They are changed only through a [`GateGuard`], that is, with the lock
//! held, and read lock-free by the wakeup logic and by statistics.
//!
//! # Lost wakeups
//!
//! The workflow of a waiter is:
//!
//! 10. Waiter: check condition
//! 20. Waiter: add itself to the waiting list
//! 30. Waiter: sleep
//!
//! 40. Releaser: unlock the flow / update the levels
//! 50. Releaser: pick a waiter from the list and wake it
//!
//! If step 50 ran between steps 10 and 20, the waiter would sleep until its
//! deadline. To avoid that, steps 10-20 run under the list lock, and the
//! releaser takes the list lock only after step 40. Either the waiter sees the
//! new state, or the releaser sees the waiter.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Used when `now + timeout` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// What a parked thread is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// The flow lock
    Lock,
    /// `free > 0`
    Space,
    /// `valid > 0`
    Data,
}

/// Why a wait ended without its condition being met
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("wait timed out")]
    TimedOut,
    #[error("wait interrupted")]
    Interrupted,
}

// ============================================================================
// Waiter
// ============================================================================

#[derive(Debug, Default)]
struct WaiterState {
    woken: bool,
    interrupted: bool,
}

/// One parked thread. Registered in the gate's list as an exclusive waiter.
struct Waiter {
    wait_for: WaitFor,
    state: Mutex<WaiterState>,
    cvar: Condvar,
}

impl Waiter {
    fn new(wait_for: WaitFor) -> Arc<Self> {
        Arc::new(Self {
            wait_for,
            state: Mutex::new(WaiterState::default()),
            cvar: Condvar::new(),
        })
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.cvar.notify_one();
    }

    fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.cvar.notify_one();
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("wait_for", &self.wait_for)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Interrupt
// ============================================================================

#[derive(Debug, Default)]
struct InterruptState {
    pending: bool,
    parked: Vec<Arc<Waiter>>,
}

/// Aborts waits made on behalf of one session
///
/// The handle is cheap to clone and can be fired from any thread. If threads
/// of the session are parked, each of them returns
/// [`WaitError::Interrupted`]. Otherwise the interrupt stays pending and
/// aborts the next wait, like a signal delivered between two system calls.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<Mutex<InterruptState>>,
}

impl Interrupt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        let mut state = self.inner.lock();
        if state.parked.is_empty() {
            state.pending = true;
            return;
        }
        log::debug!("interrupt: waking {} parked waiter(s)", state.parked.len());
        for waiter in &state.parked {
            waiter.interrupt();
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }

    /// Discard a pending interrupt
    pub fn clear(&self) {
        self.inner.lock().pending = false;
    }

    /// Attach a waiter for the duration of one park. A pending interrupt is
    /// consumed and delivered to it right away.
    fn attach(&self, waiter: &Arc<Waiter>) -> Attached<'_> {
        let mut state = self.inner.lock();
        if std::mem::take(&mut state.pending) {
            waiter.interrupt();
        }
        state.parked.push(Arc::clone(waiter));
        Attached {
            interrupt: self,
            waiter: Arc::clone(waiter),
        }
    }
}

struct Attached<'a> {
    interrupt: &'a Interrupt,
    waiter: Arc<Waiter>,
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        let mut state = self.interrupt.inner.lock();
        state.parked.retain(|w| !Arc::ptr_eq(w, &self.waiter));
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Lock of one flow, its parked waiters, and its byte levels
pub struct Gate<T> {
    name: String,
    lock: Mutex<T>,
    capacity: usize,
    valid: AtomicUsize,
    free: AtomicUsize,
    /// Threads inside a space/data wait
    waiting: AtomicUsize,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl<T> Gate<T> {
    /// Create a gate around `value` for a flow of `capacity` bytes, initially empty
    pub fn new(name: impl Into<String>, value: T, capacity: usize) -> Self {
        Self {
            name: name.into(),
            lock: Mutex::new(value),
            capacity,
            valid: AtomicUsize::new(0),
            free: AtomicUsize::new(capacity),
            waiting: AtomicUsize::new(0),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn valid_bytes(&self) -> usize {
        self.valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Number of threads currently waiting for space or data
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Number of threads parked for any reason
    #[must_use]
    pub fn parked(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Take the lock if it is free. Never blocks.
    #[must_use]
    pub fn try_acquire(&self) -> Option<GateGuard<'_, T>> {
        self.lock.try_lock().map(|guard| GateGuard::new(self, guard))
    }

    /// Take the lock, waiting as long as it takes. Not interruptible.
    ///
    /// Used by the deferred-write worker, which acts for no session.
    pub fn acquire(&self) -> GateGuard<'_, T> {
        GateGuard::new(self, self.lock.lock())
    }

    /// Take the lock, parking for at most `timeout` while it is held elsewhere.
    ///
    /// # Errors
    ///
    /// [`WaitError::TimedOut`] when the deadline passes, or
    /// [`WaitError::Interrupted`] when `interrupt` fires. Nothing is held on error.
    pub fn acquire_blocking(
        &self,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<GateGuard<'_, T>, WaitError> {
        if let Some(guard) = self.try_acquire() {
            return Ok(guard);
        }

        let deadline = deadline_after(timeout);
        loop {
            let waiter = {
                let mut waiters = self.waiters.lock();
                if let Some(guard) = self.try_acquire() {
                    return Ok(guard);
                }
                let waiter = Waiter::new(WaitFor::Lock);
                waiters.push_back(Arc::clone(&waiter));
                waiter
            };
            log::debug!("gate.acquire: {} parking for the lock", self.name);
            self.park(&waiter, deadline, interrupt)?;
        }
    }

    /// Park until the flow has free space ([`WaitFor::Space`]) or data
    /// ([`WaitFor::Data`]). The caller must not hold the lock.
    ///
    /// Returning `Ok` means the condition held at some point; it may be gone
    /// again by the time the caller re-acquires the lock.
    ///
    /// # Errors
    ///
    /// [`WaitError::TimedOut`] or [`WaitError::Interrupted`].
    pub fn wait_until_ready(
        &self,
        wait_for: WaitFor,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<(), WaitError> {
        debug_assert_ne!(wait_for, WaitFor::Lock, "use acquire_blocking");

        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaitingCount(&self.waiting);

        let deadline = deadline_after(timeout);
        loop {
            let waiter = {
                let mut waiters = self.waiters.lock();
                if self.is_ready(wait_for) {
                    return Ok(());
                }
                let waiter = Waiter::new(wait_for);
                waiters.push_back(Arc::clone(&waiter));
                waiter
            };
            log::debug!("gate.wait: {} parking for {wait_for:?}", self.name);
            self.park(&waiter, deadline, interrupt)?;
        }
    }

    /// Wake the first parked waiter that can make progress, if any
    pub fn notify_one(&self) {
        let mut waiters = self.waiters.lock();
        let Some(pos) = waiters.iter().position(|w| self.is_ready(w.wait_for)) else {
            log::trace!(
                "gate.notify: {} nobody to wake ({} parked)",
                self.name,
                waiters.len()
            );
            return;
        };
        let Some(waiter) = waiters.remove(pos) else {
            return;
        };
        drop(waiters);

        log::debug!("gate.notify: {} waking {:?}", self.name, waiter.wait_for);
        waiter.wake();
    }

    fn is_ready(&self, wait_for: WaitFor) -> bool {
        match wait_for {
            WaitFor::Lock => !self.lock.is_locked(),
            WaitFor::Space => self.free_bytes() > 0,
            WaitFor::Data => self.valid_bytes() > 0,
        }
    }

    /// Sleep until the waiter is woken, interrupted, or the deadline passes.
    /// On failure the waiter is taken off the list.
    fn park(
        &self,
        waiter: &Arc<Waiter>,
        deadline: Instant,
        interrupt: &Interrupt,
    ) -> Result<(), WaitError> {
        let attached = interrupt.attach(waiter);

        let mut state = waiter.state.lock();
        let outcome = loop {
            if state.interrupted {
                break Err(WaitError::Interrupted);
            }
            if state.woken {
                break Ok(());
            }
            if waiter.cvar.wait_until(&mut state, deadline).timed_out() {
                break if state.interrupted {
                    Err(WaitError::Interrupted)
                } else if state.woken {
                    Ok(())
                } else {
                    Err(WaitError::TimedOut)
                };
            }
        };
        drop(state);
        drop(attached);

        if let Err(e) = outcome {
            log::debug!("gate.park: {} gave up waiting: {e}", self.name);
            self.cancel(waiter);
        }
        outcome
    }

    /// Take a waiter that gave up off the list. If a releaser already picked
    /// it, hand the wakeup on so it is not lost.
    fn cancel(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            waiters.remove(pos);
            return;
        }
        drop(waiters);
        self.notify_one();
    }
}

impl<T> fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("name", &self.name)
            .field("locked", &self.lock.is_locked())
            .field("valid", &self.valid_bytes())
            .field("free", &self.free_bytes())
            .field("parked", &self.waiters.lock().len())
            .finish()
    }
}

struct WaitingCount<'a>(&'a AtomicUsize);

impl Drop for WaitingCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

// ============================================================================
// Guard
// ============================================================================

/// Proof that the gate's lock is held
///
/// Dropping the guard unlocks the flow and then wakes one eligible waiter.
/// [`GateGuard::release_and_notify`] does the same, by name.
pub struct GateGuard<'a, T> {
    // Fields drop in declaration order: unlock first, then notify
    guard: MutexGuard<'a, T>,
    notify: NotifyOnDrop<'a, T>,
}

/// Wakes one eligible waiter of `gate` when dropped
struct NotifyOnDrop<'a, T> {
    gate: &'a Gate<T>,
}

impl<T> Drop for NotifyOnDrop<'_, T> {
    fn drop(&mut self) {
        self.gate.notify_one();
    }
}

impl<'a, T> GateGuard<'a, T> {
    fn new(gate: &'a Gate<T>, guard: MutexGuard<'a, T>) -> Self {
        Self {
            guard,
            notify: NotifyOnDrop { gate },
        }
    }

    #[must_use]
    pub fn gate(&self) -> &'a Gate<T> {
        self.notify.gate
    }

    #[must_use]
    pub fn valid_bytes(&self) -> usize {
        self.gate().valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.gate().free.load(Ordering::Acquire)
    }

    /// Take `n` bytes out of the free space before they are stored
    pub fn reserve(&mut self, n: usize) {
        let free = self.free_bytes();
        debug_assert!(n <= free, "reserve {n} > free {free}");
        self.gate().free.store(free.saturating_sub(n), Ordering::Release);
    }

    /// Give back a reservation that will not be stored
    pub fn unreserve(&mut self, n: usize) {
        let free = self.free_bytes();
        debug_assert!(free + n <= self.gate().capacity);
        self.gate().free.store(free + n, Ordering::Release);
    }

    /// Make `n` stored bytes (already reserved) readable
    pub fn publish(&mut self, n: usize) {
        let valid = self.valid_bytes();
        debug_assert!(valid + n <= self.gate().capacity);
        self.gate().valid.store(valid + n, Ordering::Release);
    }

    /// Account for `n` bytes consumed by a reader
    pub fn retire(&mut self, n: usize) {
        let valid = self.valid_bytes();
        debug_assert!(n <= valid, "retire {n} > valid {valid}");
        self.gate().valid.store(valid.saturating_sub(n), Ordering::Release);
        self.unreserve(n);
    }

    /// Unlock and wake one eligible waiter
    pub fn release_and_notify(self) {
        drop(self);
    }
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
