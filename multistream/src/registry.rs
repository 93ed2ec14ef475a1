//! Unit registry
//!
//! A [`Device`] owns a fixed set of units, built once, addressed by a
//! bounds-checked index. Each [`Unit`] has two independent flows, one per
//! [`Priority`], and an enabled flag. The device also owns the deferred-write
//! worker shared by all low-priority flows.
//!
//! Teardown stops the worker before the units go away: no new deferred
//! writes are accepted, queued ones are appended, then the worker is joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowStats, Priority};
use crate::scheduler::DeferredWriter;
use crate::session::{Session, SessionIds};

/// Snapshot of a unit's state, read without taking any lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStats {
    pub enabled: bool,
    pub low: FlowStats,
    pub high: FlowStats,
}

impl UnitStats {
    #[must_use]
    pub fn flow(&self, priority: Priority) -> &FlowStats {
        match priority {
            Priority::Low => &self.low,
            Priority::High => &self.high,
        }
    }
}

#[derive(Debug)]
pub struct Unit {
    id: usize,
    enabled: AtomicBool,
    flows: [Arc<Flow>; 2],
}

impl Unit {
    fn new(id: usize, config: &Config) -> Result<Self> {
        Ok(Self {
            id,
            enabled: AtomicBool::new(true),
            flows: [
                Arc::new(Flow::new(id, Priority::Low, config)?),
                Arc::new(Flow::new(id, Priority::High, config)?),
            ],
        })
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn flow(&self, priority: Priority) -> &Arc<Flow> {
        &self.flows[priority.index()]
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            log::info!(
                "unit.enable: unit {} {}",
                self.id,
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    #[must_use]
    pub fn stats(&self) -> UnitStats {
        UnitStats {
            enabled: self.is_enabled(),
            low: self.flow(Priority::Low).stats(),
            high: self.flow(Priority::High).stats(),
        }
    }
}

/// The set of units plus the deferred-write worker
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use multistream::{Config, Device};
///
/// let device = Arc::new(Device::new(Config { units: 2, ..Config::default() }).unwrap());
/// let session = device.open(1).unwrap();
/// assert_eq!(session.write(b"hello").unwrap(), 5);
/// assert_eq!(session.read(16).unwrap(), b"hello");
/// ```
#[derive(Debug)]
pub struct Device {
    config: Config,
    units: Vec<Arc<Unit>>,
    deferred: DeferredWriter,
    sessions: SessionIds,
}

impl Device {
    /// Build every unit, each flow with its first chunk, and start the worker
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for an unusable config, [`Error::OutOfMemory`]
    /// if a unit or the worker cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let mut units = Vec::new();
        units
            .try_reserve_exact(config.units)
            .map_err(|_| Error::OutOfMemory)?;
        for id in 0..config.units {
            units.push(Arc::new(Unit::new(id, &config)?));
        }
        let deferred = DeferredWriter::start(config.deferred_queue_depth)?;

        log::info!(
            "device.new: {} units, {} bytes per flow",
            config.units,
            config.capacity()
        );
        Ok(Self {
            config,
            units,
            deferred,
            sessions: SessionIds::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of units
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// # Errors
    ///
    /// [`Error::NoSuchUnit`] if `id` is out of range.
    pub fn unit(&self, id: usize) -> Result<&Arc<Unit>> {
        self.units.get(id).ok_or(Error::NoSuchUnit(id))
    }

    pub fn units(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.units.iter()
    }

    /// Open a session on a unit, with high priority and no blocking
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchUnit`] or [`Error::UnitDisabled`].
    pub fn open(self: &Arc<Self>, unit: usize) -> Result<Session> {
        let target = Arc::clone(self.unit(unit)?);
        if !target.is_enabled() {
            log::warn!("device.open: unit {unit} is disabled");
            return Err(Error::UnitDisabled(unit));
        }
        let id = self.sessions.issue();
        log::debug!("device.open: session {id} on unit {unit}");
        Ok(Session::new(id, Arc::clone(self), target))
    }

    pub(crate) fn deferred(&self) -> &DeferredWriter {
        &self.deferred
    }

    /// Wait until every low-priority write accepted so far is readable
    pub fn flush_deferred(&self) {
        self.deferred.flush();
    }

    /// Stop the deferred worker after draining its queue. Low-priority writes
    /// fail with [`Error::ShutDown`] afterwards.
    pub fn shutdown(&self) {
        self.deferred.shutdown();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
        log::debug!("device.drop: releasing {} units", self.units.len());
    }
}
