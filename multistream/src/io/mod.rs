//! Storage layer of a flow
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Flow (read/write entry points)     │
//! │  - session timeout & interrupt      │
//! │  - capacity accounting              │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ guarded by
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  Gate (lock + parked waiters)       │
//! │  - valid / free byte levels         │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ protects
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  ChunkStore (this module)           │
//! │  - fixed-size chunks, FIFO          │
//! │  - arena + free list                │
//! └─────────────────────────────────────┘
//! ```

pub mod chunks;

pub use chunks::{ChunkId, ChunkStore};
