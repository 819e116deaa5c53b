//! Driver-side error type.
//!
//! `thiserror` needs `std` (or at least a `Display`-deriving proc macro that
//! assumes an allocator-free `core`-only target never quite matches); rather
//! than chase feature flags to make it behave under `no_std`, the error enum
//! here implements `Display`/`core::error::Error` by hand the way the rest
//! of this crate avoids std assumptions.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// `INIT_OFFERER`/`INIT_RECEIVER` called on an instance that is already
    /// past `Opened` (Invariant I2).
    AlreadyInitialized,
    /// An operation that requires `INIT_*` to have run first was issued
    /// before it (mmap, WAIT, AWAIT, SSIG).
    NotInitialized,
    /// `pages` was zero or exceeded `shmpipe_proto::MAX_ALIGNED_PAGES`.
    InvalidPageCount,
    /// The hypervisor abstraction reported a grant/event-channel failure.
    Hypervisor,
    /// mmap was attempted twice, or attempted before the peer's grant
    /// reference was known.
    AlreadyMapped,
    /// `AWAIT` timed out without any flag in the request becoming set.
    TimedOut,
    /// The instance was released while a thread was parked in `AWAIT`/`WAIT`.
    Interrupted,
    /// A caller-supplied buffer was the wrong length for the ioctl.
    InvalidArgument,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AlreadyInitialized => "instance already initialized",
            Self::NotInitialized => "instance not initialized",
            Self::InvalidPageCount => "invalid page count",
            Self::Hypervisor => "hypervisor operation failed",
            Self::AlreadyMapped => "instance already mapped",
            Self::TimedOut => "wait timed out",
            Self::Interrupted => "wait interrupted by release",
            Self::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for DriverError {}

pub type Result<T> = core::result::Result<T, DriverError>;
