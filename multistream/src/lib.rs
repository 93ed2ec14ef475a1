//! Per-unit, dual-priority, chunked byte streams
//!
//! A [`Device`] holds a fixed set of units. Each unit carries two FIFO byte
//! flows, high and low priority, each bounded to `chunk_size * max_chunks`
//! bytes and stored as a chain of fixed-size chunks. Callers open a
//! [`Session`] on a unit and read or write the flow selected by the
//! session's priority, either non-blocking or with a bounded timeout.
//!
//! High-priority writes are stored before `write` returns. Low-priority
//! writes reserve their space and are appended later, in submission order,
//! by a single worker thread.

pub mod config;
pub mod error;
pub mod flow;
pub mod gate;
pub mod io;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};

// Re-export flow types for convenience
pub use flow::{Flow, FlowStats, Priority, WaitPolicy};

// Re-export synchronization types for convenience
pub use gate::{Gate, GateGuard, Interrupt, WaitError, WaitFor};

pub use registry::{Device, Unit, UnitStats};
pub use scheduler::DeferredWriter;
pub use session::{Command, Session, SessionAttrs, SessionId};
