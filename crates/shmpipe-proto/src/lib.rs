//! Fixed, `repr(C)` wire layouts shared across the shmpipe privilege
//! boundary (driver <-> pipe library) and across the rendezvous UDP
//! protocol (listener <-> client).
//!
//! Everything here is a plain data definition: no I/O, no synchronization
//! policy beyond the atomic types the meta page itself requires to be a
//! valid SPSC control block. Byte offsets are frozen by explicit padding
//! fields rather than left to the compiler, since this struct is a wire
//! format between two independently built binaries (spec.md §9).

#![no_std]

use core::sync::atomic::{AtomicU32, AtomicU8};

pub mod rendezvous;

/// Compile-time bound on the grant-reference array, matching the source's
/// `MAX_ALIGNED_PAGES`.
pub const MAX_ALIGNED_PAGES: usize = 128;

pub const PAGE_SIZE: usize = 4096;

/// One side's lifecycle as observed by its peer through the meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    None = 0,
    Opened = 1,
    Closed = 2,
}

impl PeerState {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Opened),
            2 => Some(Self::Closed),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Per-side ring flags (spec.md §3 I3, §4.2 adaptive protocol).
    ///
    /// OPENED/CLOSED mirror the lifecycle `PeerState` carries at the
    /// meta-page level so a side can check its own liveness without a
    /// second load; WAITING/SLEEPING drive the spin/park handshake.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SideFlags: u32 {
        const OPENED   = 1 << 0;
        const CLOSED   = 1 << 1;
        const WAITING  = 1 << 2;
        const SLEEPING = 1 << 3;
    }
}

/// The ring head/tail and per-side flag words (spec.md §3 RingControl).
///
/// Only the writer mutates `write_pos`/`writer_flags`; only the reader
/// mutates `read_pos`/`reader_flags` (Invariant I3). Both sides may load
/// either field at any time, hence `Atomic*` rather than plain integers.
#[repr(C)]
pub struct RingControl {
    pub writer_flags: AtomicU32,
    pub reader_flags: AtomicU32,
    pub write_pos: AtomicU32,
    pub read_pos: AtomicU32,
}

/// The first page of the shared region (spec.md §3 MetaPage, §6 wire
/// layout). Grant references and the event-channel port are written once
/// during setup, before either side's peer state is observed as `Opened`
/// by the other; the `Release` store of that transition is what makes the
/// earlier plain writes visible, so those fields don't need to be atomic
/// themselves.
#[repr(C)]
pub struct MetaPage {
    pub offerer_state: AtomicU8,
    pub receiver_state: AtomicU8,
    pub page_count: u8,
    _pad0: u8,
    pub offerer_event_port: u32,
    pub grant_refs: [u32; MAX_ALIGNED_PAGES],
    pub ring: RingControl,
}

impl MetaPage {
    /// Offset, in bytes, of the first byte after the meta page — i.e. the
    /// start of the ring's usable buffer (spec.md §3 Invariant I4).
    pub const BUFFER_OFFSET: usize = core::mem::size_of::<MetaPage>();

    /// Zero-initialize a freshly allocated meta page in place.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<MetaPage>()` bytes of
    /// writable, properly aligned memory that outlives the returned
    /// reference.
    pub unsafe fn init_in_place<'a>(ptr: *mut u8, page_count: u8) -> &'a MetaPage {
        core::ptr::write_bytes(ptr, 0, core::mem::size_of::<MetaPage>());
        let meta = &*(ptr as *const MetaPage);
        meta.offerer_state
            .store(PeerState::None as u8, core::sync::atomic::Ordering::Relaxed);
        meta.receiver_state
            .store(PeerState::None as u8, core::sync::atomic::Ordering::Relaxed);
        (*(ptr as *mut MetaPage)).page_count = page_count;
        meta
    }

    /// Reinterpret a byte slice known to be at least `size_of::<MetaPage>()`
    /// long and `align_of::<MetaPage>()`-aligned as a `MetaPage` reference.
    ///
    /// # Safety
    /// Caller must guarantee alignment, length, and that no other thread
    /// mutates the non-atomic fields (`page_count`, `offerer_event_port`,
    /// `grant_refs`) concurrently with this call.
    pub unsafe fn from_bytes<'a>(bytes: &'a [u8]) -> &'a MetaPage {
        debug_assert!(bytes.len() >= core::mem::size_of::<MetaPage>());
        &*(bytes.as_ptr() as *const MetaPage)
    }
}

/// ioctl command numbers, arbitrary but stable (spec.md §6 mentions a
/// shared "magic" byte the real driver uses to reject cross-subsystem
/// ioctl misuse; we fold command *and* magic into one `u32` the way
/// `nix::ioctl_*!` macros expect).
pub mod cmd {
    pub const MAGIC: u8 = 83;
    pub const INIT_OFFERER: u8 = 1;
    pub const INIT_RECEIVER: u8 = 2;
    pub const WAIT: u8 = 3;
    pub const AWAIT: u8 = 4;
    pub const SSIG: u8 = 5;
    pub const GET_DOMID: u8 = 6;
}

bitflags::bitflags! {
    /// `AWAIT` wake-reason flags (spec.md §6).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AwaitFlags: u8 {
        const USER  = 0x1;
        const INIT  = 0x2;
        const MUTEX = 0x4;
    }
}

/// `INIT_OFFERER` ioctl payload. `nix::ioctl_readwrite!` writes its response
/// back into the same buffer it read the request from, so request and
/// response fields share one struct: the caller fills `pages`/
/// `distant_domid`, the driver overwrites `grant_ref`/`local_domid` in
/// place before returning.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct InitOffererIoctl {
    pub pages: u8,
    pub distant_domid: u16,
    pub grant_ref: u32,
    pub local_domid: u16,
}

/// `INIT_RECEIVER` ioctl request payload.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct InitReceiverReq {
    pub pages: u8,
    pub distant_domid: u16,
    pub grant_ref: u32,
}

/// `AWAIT` ioctl request/response payload.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct AwaitReq {
    pub flags: u8,
    pub timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct AwaitResp {
    pub remaining_ms: u64,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct GetDomidResp {
    pub local_domid: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_page_layout_is_frozen() {
        // offerer_state, receiver_state, page_count, pad, port, grant_refs, ring
        let expected = 1 + 1 + 1 + 1 + 4 + MAX_ALIGNED_PAGES * 4 + 4 * 4;
        assert_eq!(core::mem::size_of::<MetaPage>(), expected);
    }

    #[test]
    fn side_flags_roundtrip() {
        let bits = (SideFlags::OPENED | SideFlags::WAITING).bits();
        assert_eq!(
            SideFlags::from_bits_truncate(bits),
            SideFlags::OPENED | SideFlags::WAITING
        );
    }
}
