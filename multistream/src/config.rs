//! Device configuration
//!
//! Defaults reproduce the classic layout: 128 units, two flows per unit,
//! each flow made of at most five 4 KiB chunks (20480 bytes), and a
//! blocking timeout counted in 10 ms ticks.
//!
//! A config can be built in code or read from JSON; missing keys fall back
//! to the defaults:
//!
//! ```
//! use multistream::Config;
//!
//! let config = Config::from_json_str(r#"{ "units": 4, "max_chunks": 2 }"#).unwrap();
//! assert_eq!(config.units, 4);
//! assert_eq!(config.capacity(), 8192);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of units in the registry
    pub units: usize,
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Chunks worth of capacity per flow
    pub max_chunks: usize,
    /// Length of one blocking-timeout tick, in milliseconds
    pub timeout_unit_ms: u64,
    /// Bound of the deferred-write queue
    pub deferred_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            units: 128,
            chunk_size: 4096,
            max_chunks: 5,
            timeout_unit_ms: 10,
            deferred_queue_depth: 1024,
        }
    }
}

impl Config {
    /// Parse and validate a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the JSON is malformed, has unknown
    /// keys, or describes an unusable layout.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::from_json_str`], reading from an `io::Read`.
    ///
    /// # Errors
    ///
    /// See [`Config::from_json_str`].
    pub fn from_json_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Config =
            serde_json::from_reader(reader).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero sizes or a flow capacity
    /// that overflows `usize`.
    pub fn validate(&self) -> Result<()> {
        if self.units == 0 {
            return Err(Error::InvalidConfig("units must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.max_chunks == 0 {
            return Err(Error::InvalidConfig("max_chunks must be positive".into()));
        }
        if self.timeout_unit_ms == 0 {
            return Err(Error::InvalidConfig("timeout_unit_ms must be positive".into()));
        }
        if self.deferred_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "deferred_queue_depth must be positive".into(),
            ));
        }
        if self.chunk_size.checked_mul(self.max_chunks).is_none() {
            return Err(Error::InvalidConfig(format!(
                "flow capacity {} x {} overflows",
                self.chunk_size, self.max_chunks
            )));
        }
        Ok(())
    }

    /// Bytes one flow can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunk_size.saturating_mul(self.max_chunks)
    }

    /// Convert a timeout expressed in ticks into a duration
    #[must_use]
    pub fn timeout(&self, ticks: u64) -> Duration {
        Duration::from_millis(ticks.saturating_mul(self.timeout_unit_ms))
    }
}
