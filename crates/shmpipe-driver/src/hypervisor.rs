//! Abstraction over the hypercalls spec.md §6 assumes are "available to the
//! driver": grant-table and event-channel management. Nothing in this
//! environment can issue a real hypercall, so the driver is written against
//! this trait and exercised against `local::LocalHypervisor` (feature
//! `sim`), a same-process stand-in for two domains.

use alloc::sync::Arc;

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GrantRef(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventPort(pub u32);

/// A mapping of foreign pages into this domain's address space. Dropping it
/// does not unmap; callers must go through `Hypervisor::unmap_grant_ref`
/// (mirrors spec.md's asymmetric teardown: unmapping and ungranting are
/// distinct operations with different legality windows).
pub trait Mapping: Send {
    /// Pointer to the first byte of the mapped region.
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Locally-allocated frames backing an offered grant.
pub trait Frames: Send {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Hypercall surface the driver needs. Implementors own whatever locking is
/// required to make these safe to call from multiple `DriverInstance`s
/// concurrently; the driver itself never assumes a global lock here.
pub trait Hypervisor: Send + Sync {
    type Frames: Frames;
    type Mapping: Mapping;

    fn local_domid(&self) -> DomId;

    /// Allocate `pages` contiguous, zeroed frames owned by this domain.
    fn alloc_frames(&self, pages: u8) -> Result<Self::Frames>;

    /// Grant `distant` read/write access to `frames`, returning the
    /// reference the peer will present back over the rendezvous channel or
    /// `INIT_RECEIVER`.
    fn grant_foreign_access(&self, frames: &Self::Frames, distant: DomId) -> Result<GrantRef>;

    /// Revoke a previously issued grant. Spec.md Invariant I1/§9: must only
    /// be called once the offerer knows the peer will never map it again
    /// (i.e. from the deferred-teardown sweep, not at `close()` time).
    fn end_foreign_access(&self, grant: GrantRef) -> Result<()>;

    /// Map `pages` pages granted by `distant` under `grant` into this
    /// domain's address space.
    fn map_grant(&self, grant: GrantRef, distant: DomId, pages: u8) -> Result<Self::Mapping>;

    fn unmap_grant(&self, mapping: Self::Mapping) -> Result<()>;

    /// Allocate an event channel port not yet bound to a remote domain.
    fn alloc_unbound_port(&self, remote: DomId) -> Result<EventPort>;

    /// Bind to a port the remote side already allocated.
    fn bind_port(&self, remote: DomId, remote_port: EventPort) -> Result<EventPort>;

    fn close_port(&self, port: EventPort) -> Result<()>;

    /// Signal the peer bound to `port`. The only hypercall the spec allows
    /// from interrupt context (its handler both acks and echoes).
    fn notify(&self, port: EventPort);

    /// Register the handler invoked when `port` fires. `sink` must be
    /// callable from interrupt context: it may not allocate, block, or log
    /// (spec.md §9 "Event-channel handler constraints").
    fn set_handler(&self, port: EventPort, sink: Arc<dyn EventSink>);
}

/// Interrupt-context callback. Implementations must complete in O(1) with
/// no allocation and no blocking — typically a flag store plus a wake.
pub trait EventSink: Send + Sync {
    fn on_event(&self);
}

impl From<()> for DriverError {
    fn from(_: ()) -> Self {
        DriverError::Hypervisor
    }
}
