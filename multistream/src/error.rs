//! Error type for device operations
//!
//! Every failure of a read, write or control call is reported synchronously
//! through [`Error`]. Nothing is retried internally, except that a write or a
//! read acquires the flow lock a second time after a successful wait for
//! space or data.

/// POSIX errno values used by [`Error::errno`]
pub mod errno {
    pub const EINTR: i32 = 4;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENODATA: i32 = 61;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
    pub const EPERM: i32 = 1;
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The flow has no free space (non-blocking, or the wait expired)
    #[error("no space left on flow")]
    NoSpace,

    /// The flow holds no data (blocking read whose wait expired)
    #[error("no data available on flow")]
    NoData,

    /// Non-blocking acquisition found the flow lock taken
    #[error("flow lock is held by another operation")]
    LockUnavailable,

    /// Blocking acquisition of the flow lock exceeded the session timeout
    #[error("timed out waiting for the flow lock")]
    Timeout,

    /// A wait was aborted through the session's interrupt handle
    #[error("wait interrupted")]
    Interrupted,

    /// A chunk, a read buffer or a deferred-write copy could not be allocated,
    /// or the deferred-write queue is full
    #[error("out of memory")]
    OutOfMemory,

    #[error("unit {0} is disabled")]
    UnitDisabled(usize),

    #[error("invalid control command {code} (param {param})")]
    InvalidCommand { code: u32, param: u64 },

    #[error("no such unit: {0}")]
    NoSuchUnit(usize),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The deferred-write worker is stopped
    #[error("deferred writer is shut down")]
    ShutDown,
}

impl Error {
    /// The errno a file-descriptor style caller would observe
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSpace => errno::ENOSPC,
            Self::NoData => errno::ENODATA,
            Self::LockUnavailable => errno::EAGAIN,
            Self::Timeout => errno::ETIMEDOUT,
            Self::Interrupted => errno::EINTR,
            Self::OutOfMemory => errno::ENOMEM,
            Self::UnitDisabled(_) => errno::EPERM,
            Self::InvalidCommand { .. } | Self::InvalidConfig(_) => errno::EINVAL,
            Self::NoSuchUnit(_) => errno::ENODEV,
            Self::ShutDown => errno::ESHUTDOWN,
        }
    }
}
