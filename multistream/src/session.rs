//! Sessions and control commands
//!
//! A [`Session`] is one opener's view of a unit: it carries the priority
//! that selects the flow and the blocking timeout used at both wait points.
//! Attributes change only through [`Session::control`], which takes the lock
//! of the session's current flow first, so a command is ordered against the
//! reads and writes running on that flow. Operations already in progress
//! keep the attributes they started with.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::flow::{Priority, WaitPolicy};
use crate::gate::Interrupt;
use crate::registry::{Device, Unit};

/// Identifier of an open session, unique within its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Issues session ids in opening order, starting at 1
#[derive(Debug)]
pub(crate) struct SessionIds(AtomicU64);

impl SessionIds {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn issue(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-session attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAttrs {
    pub priority: Priority,
    /// Zero means non-blocking
    pub timeout: Duration,
}

impl Default for SessionAttrs {
    fn default() -> Self {
        Self {
            priority: Priority::High,
            timeout: Duration::ZERO,
        }
    }
}

/// A control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetPriority(Priority),
    /// Timeout in ticks of `Config::timeout_unit_ms`; 0 disables blocking
    SetBlockingTimeout(u64),
    /// Applies to the whole unit, every session included
    SetUnitEnabled(bool),
}

impl Command {
    pub const SET_PRIO: u32 = 1;
    pub const SET_BLOCKING: u32 = 3;
    pub const SET_OPENCLOSE: u32 = 4;

    /// Decode an ioctl-style `(code, param)` pair
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommand`] for an unknown code or an out-of-range param.
    pub fn from_raw(code: u32, param: u64) -> Result<Self> {
        let invalid = || Error::InvalidCommand { code, param };
        match code {
            Self::SET_PRIO => Priority::from_raw(param)
                .map(Self::SetPriority)
                .ok_or_else(invalid),
            Self::SET_BLOCKING => Ok(Self::SetBlockingTimeout(param)),
            Self::SET_OPENCLOSE => match param {
                0 => Ok(Self::SetUnitEnabled(false)),
                1 => Ok(Self::SetUnitEnabled(true)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

/// An open handle on one unit
pub struct Session {
    id: SessionId,
    device: Arc<Device>,
    unit: Arc<Unit>,
    attrs: Mutex<SessionAttrs>,
    interrupt: Interrupt,
}

impl Session {
    pub(crate) fn new(id: SessionId, device: Arc<Device>, unit: Arc<Unit>) -> Self {
        Self {
            id,
            device,
            unit,
            attrs: Mutex::new(SessionAttrs::default()),
            interrupt: Interrupt::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn unit(&self) -> &Arc<Unit> {
        &self.unit
    }

    #[must_use]
    pub fn attrs(&self) -> SessionAttrs {
        *self.attrs.lock()
    }

    /// Handle that aborts this session's waits, usable from any thread
    #[must_use]
    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Write to the flow of the session's priority.
    ///
    /// Returns the number of bytes accepted, which is less than `bytes.len()`
    /// when the flow has less free space.
    ///
    /// # Errors
    ///
    /// [`Error::UnitDisabled`], lock errors ([`Error::LockUnavailable`],
    /// [`Error::Timeout`], [`Error::Interrupted`]), [`Error::NoSpace`],
    /// [`Error::OutOfMemory`], [`Error::ShutDown`].
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.ensure_enabled()?;
        let attrs = self.attrs();
        let wait = WaitPolicy::new(attrs.timeout, &self.interrupt);
        let result = self
            .unit
            .flow(attrs.priority)
            .write(bytes, &wait, self.device.deferred());
        if let Err(e) = &result {
            log::debug!("session.write: {} ({}) failed: {e}", self.id, attrs.priority);
        }
        result
    }

    /// Read up to `max_len` bytes from the flow of the session's priority.
    ///
    /// # Errors
    ///
    /// [`Error::UnitDisabled`], lock errors, [`Error::NoData`],
    /// [`Error::OutOfMemory`].
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        self.ensure_enabled()?;
        let attrs = self.attrs();
        let wait = WaitPolicy::new(attrs.timeout, &self.interrupt);
        let result = self.unit.flow(attrs.priority).read(max_len, &wait);
        if let Err(e) = &result {
            log::debug!("session.read: {} ({}) failed: {e}", self.id, attrs.priority);
        }
        result
    }

    /// Apply a control command.
    ///
    /// # Errors
    ///
    /// Lock errors from taking the current flow's lock.
    pub fn control(&self, command: Command) -> Result<()> {
        let attrs = self.attrs();
        let wait = WaitPolicy::new(attrs.timeout, &self.interrupt);
        let guard = self.unit.flow(attrs.priority).lock(&wait)?;

        match command {
            Command::SetPriority(priority) => self.attrs.lock().priority = priority,
            Command::SetBlockingTimeout(ticks) => {
                self.attrs.lock().timeout = self.device.config().timeout(ticks);
            }
            Command::SetUnitEnabled(enabled) => self.unit.set_enabled(enabled),
        }
        guard.release_and_notify();

        log::debug!("session.control: {} {command:?}", self.id);
        Ok(())
    }

    /// Decode and apply a raw `(code, param)` command
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommand`], or any error of [`Session::control`].
    pub fn ioctl(&self, code: u32, param: u64) -> Result<()> {
        let command = Command::from_raw(code, param).map_err(|e| {
            log::warn!("session.ioctl: {} rejected: {e}", self.id);
            e
        })?;
        self.control(command)
    }

    /// Close the session. Equivalent to dropping it.
    pub fn close(self) {}

    fn ensure_enabled(&self) -> Result<()> {
        if self.unit.is_enabled() {
            return Ok(());
        }
        log::warn!("session.io: {} on disabled unit {}", self.id, self.unit.id());
        Err(Error::UnitDisabled(self.unit.id()))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("unit", &self.unit.id())
            .field("attrs", &self.attrs())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("session.close: {} on unit {}", self.id, self.unit.id());
    }
}
