//! `DriverInstance`: per-open-file-descriptor state machine dispatching
//! `INIT_OFFERER`/`INIT_RECEIVER`/mmap/`WAIT`/`AWAIT`/`SSIG`/`GET_DOMID`/
//! release (spec.md §4.1). Grounded on the teacher's `KernelScheme` trait
//! (`scheme/mod.rs`), simplified to the single-device shape this driver
//! actually needs — one instance per open, no path-based multiplexing.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use core::time::Duration;

use arrayvec::ArrayVec;

use shmpipe_proto::{AwaitFlags, MetaPage, PeerState};

use crate::deferred::DeferredTeardown;
use crate::error::{DriverError, Result};
use crate::hypervisor::{DomId, EventPort, EventSink, GrantRef, Hypervisor};
use crate::wait::{Flag, Park, WaitGroup};

/// Which role this instance was opened as (Invariant I2: an instance is
/// either an offerer or a receiver, never both, and may not change role
/// after `INIT_*` succeeds once).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unset,
    Offerer,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Stage {
    Opened = 0,
    Initialized = 1,
    Mapped = 2,
}

/// Operations a device file descriptor exposes to userspace, one call per
/// ioctl command plus read/write-style mmap and release. Mirrors
/// `KernelScheme`'s shape (one method per verb, `Result`-returning) rather
/// than a single dispatch-by-opcode function, so each operation keeps its
/// own argument types instead of a raw `usize` buffer.
pub trait DeviceOps: Send + Sync {
    fn init_offerer(&self, pages: u8, distant: DomId) -> Result<(GrantRef, DomId)>;
    fn init_receiver(&self, pages: u8, distant: DomId, grant: GrantRef) -> Result<()>;
    fn mmap(&self) -> Result<*mut u8>;
    fn wait(&self) -> Result<()>;
    fn await_flags(&self, flags: AwaitFlags, timeout: Option<Duration>) -> Result<AwaitFlags>;
    fn ssig(&self) -> Result<()>;
    fn get_domid(&self) -> DomId;
    fn release(self: Arc<Self>);
}

/// Total frames backing the shared region: one dedicated meta page plus
/// `pages` data pages (spec.md §4.1 — `INIT_RECEIVER` rejects a mapping
/// whose `page_count` isn't exactly this).
fn total_pages(pages: u8) -> Result<u8> {
    if pages == 0 || pages as usize > shmpipe_proto::MAX_ALIGNED_PAGES {
        return Err(DriverError::InvalidPageCount);
    }
    pages.checked_add(1).ok_or(DriverError::InvalidPageCount)
}

/// A `DriverInstance` backed by a concrete `Hypervisor` and `Park`
/// implementation. One of these is created per `open()` of the character
/// device (spec.md §4.1).
pub struct DriverInstance<H: Hypervisor, P: Park> {
    hv: Arc<H>,
    teardown: Arc<DeferredTeardown>,
    stage: AtomicU8,
    role: spin::Mutex<Role>,
    local_domid: DomId,
    distant_domid: spin::Mutex<Option<DomId>>,
    grant: spin::Mutex<Option<GrantRef>>,
    port: spin::Mutex<Option<EventPort>>,
    mapping: spin::Mutex<Option<H::Mapping>>,
    frames: spin::Mutex<Option<H::Frames>>,
    meta: spin::Mutex<Option<*const MetaPage>>,
    user_flag: Arc<Flag>,
    init_flag: Arc<Flag>,
    waiters: Arc<WaitGroup<P>>,
}

// SAFETY: the raw `*const MetaPage` is only ever read through shared
// references into hypervisor-mapped memory that outlives the instance; all
// mutable driver-owned state lives behind the `spin::Mutex`es above.
unsafe impl<H: Hypervisor, P: Park> Send for DriverInstance<H, P> {}
unsafe impl<H: Hypervisor, P: Park> Sync for DriverInstance<H, P> {}

impl<H: Hypervisor, P: Park> DriverInstance<H, P> {
    pub fn new(hv: Arc<H>, teardown: Arc<DeferredTeardown>, park: P) -> Arc<Self> {
        let local_domid = hv.local_domid();
        Arc::new(Self {
            hv,
            teardown,
            stage: AtomicU8::new(Stage::Opened as u8),
            role: spin::Mutex::new(Role::Unset),
            local_domid,
            distant_domid: spin::Mutex::new(None),
            grant: spin::Mutex::new(None),
            port: spin::Mutex::new(None),
            mapping: spin::Mutex::new(None),
            frames: spin::Mutex::new(None),
            meta: spin::Mutex::new(None),
            user_flag: Arc::new(Flag::new()),
            init_flag: Arc::new(Flag::new()),
            waiters: Arc::new(WaitGroup::new(park)),
        })
    }

    fn stage(&self) -> Stage {
        match self.stage.load(Ordering::Acquire) {
            0 => Stage::Opened,
            1 => Stage::Initialized,
            _ => Stage::Mapped,
        }
    }
}

/// The event-channel handler bound to an instance's port. The first event
/// it ever observes is the peer's "I am here" completion notice, which maps
/// to `AwaitFlags::INIT`; every event after that is a regular data-ready
/// signal (`AwaitFlags::USER`). `echo` is set only on the offerer side: the
/// offerer's first event is the receiver announcing itself, which the
/// offerer acks by raising its own port once so the receiver's own first
/// event fires too. The receiver's handler has no echo — its first event
/// *is* that ack, so echoing back would ping-pong forever.
struct EventRouter<H: Hypervisor, P: Park> {
    user_flag: Arc<Flag>,
    init_flag: Arc<Flag>,
    waiters: Arc<WaitGroup<P>>,
    init_observed: AtomicBool,
    echo: Option<(Arc<H>, EventPort)>,
}

impl<H: Hypervisor, P: Park> EventSink for EventRouter<H, P> {
    fn on_event(&self) {
        if !self.init_observed.swap(true, Ordering::AcqRel) {
            self.waiters.signal(&self.init_flag);
            if let Some((hv, port)) = &self.echo {
                hv.notify(*port);
            }
        } else {
            self.waiters.signal(&self.user_flag);
        }
    }
}

impl<H: Hypervisor, P: Park> DeviceOps for DriverInstance<H, P> {
    fn init_offerer(&self, pages: u8, distant: DomId) -> Result<(GrantRef, DomId)> {
        let total = total_pages(pages)?;
        if self.stage() != Stage::Opened {
            return Err(DriverError::AlreadyInitialized);
        }
        *self.role.lock() = Role::Offerer;
        let frames = self.hv.alloc_frames(total)?;
        let grant = self.hv.grant_foreign_access(&frames, distant)?;
        let port = self.hv.alloc_unbound_port(distant)?;
        self.hv.set_handler(
            port,
            Arc::new(EventRouter {
                user_flag: self.user_flag.clone(),
                init_flag: self.init_flag.clone(),
                waiters: self.waiters.clone(),
                init_observed: AtomicBool::new(false),
                echo: Some((self.hv.clone(), port)),
            }),
        );
        let meta_ptr = frames.as_ptr() as *mut MetaPage;
        unsafe {
            MetaPage::init_in_place(frames.as_ptr(), total);
            (*meta_ptr).offerer_event_port = port.0;
            (*meta_ptr)
                .offerer_state
                .store(PeerState::Opened as u8, Ordering::Release);
        }
        *self.meta.lock() = Some(meta_ptr as *const MetaPage);
        *self.distant_domid.lock() = Some(distant);
        *self.grant.lock() = Some(grant);
        *self.port.lock() = Some(port);
        *self.frames.lock() = Some(frames);
        self.stage.store(Stage::Initialized as u8, Ordering::Release);
        Ok((grant, self.local_domid))
    }

    fn init_receiver(&self, pages: u8, distant: DomId, grant: GrantRef) -> Result<()> {
        let total = total_pages(pages)?;
        if self.stage() != Stage::Opened {
            return Err(DriverError::AlreadyInitialized);
        }
        *self.role.lock() = Role::Receiver;
        let mapping = self.hv.map_grant(grant, distant, total)?;
        let meta_ptr = mapping.as_ptr() as *mut MetaPage;
        // The Acquire load pairs with the offerer's Release store of
        // `offerer_state` in `init_offerer`, making that side's earlier
        // plain writes (`page_count`, `offerer_event_port`) visible before
        // they're read below.
        let offerer_seen = unsafe { (*meta_ptr).offerer_state.load(Ordering::Acquire) };
        if PeerState::from_u8(offerer_seen) != Some(PeerState::Opened) {
            return Err(DriverError::NotInitialized);
        }
        let (page_count, offerer_port) =
            unsafe { ((*meta_ptr).page_count, (*meta_ptr).offerer_event_port) };
        if page_count != total {
            return Err(DriverError::InvalidPageCount);
        }
        unsafe {
            (*meta_ptr)
                .receiver_state
                .store(PeerState::Opened as u8, Ordering::Release);
        }
        let bound_port = self.hv.bind_port(distant, EventPort(offerer_port))?;
        self.hv.set_handler(
            bound_port,
            Arc::new(EventRouter {
                user_flag: self.user_flag.clone(),
                init_flag: self.init_flag.clone(),
                waiters: self.waiters.clone(),
                init_observed: AtomicBool::new(false),
                echo: None,
            }),
        );
        // "I am here": the offerer's first event on its own port is this
        // notify, which it echoes back so our own first event fires too.
        self.hv.notify(bound_port);
        *self.meta.lock() = Some(meta_ptr as *const MetaPage);
        *self.distant_domid.lock() = Some(distant);
        *self.grant.lock() = Some(grant);
        *self.port.lock() = Some(bound_port);
        *self.mapping.lock() = Some(mapping);
        self.stage.store(Stage::Initialized as u8, Ordering::Release);
        Ok(())
    }

    fn mmap(&self) -> Result<*mut u8> {
        if self.stage() == Stage::Opened {
            return Err(DriverError::NotInitialized);
        }
        if self.stage() == Stage::Mapped {
            return Err(DriverError::AlreadyMapped);
        }
        let ptr = match *self.role.lock() {
            Role::Offerer => self
                .frames
                .lock()
                .as_ref()
                .map(|f| f.as_ptr())
                .ok_or(DriverError::NotInitialized)?,
            Role::Receiver => self
                .mapping
                .lock()
                .as_ref()
                .map(|m| m.as_ptr())
                .ok_or(DriverError::NotInitialized)?,
            Role::Unset => return Err(DriverError::NotInitialized),
        };
        self.stage.store(Stage::Mapped as u8, Ordering::Release);
        Ok(ptr)
    }

    fn wait(&self) -> Result<()> {
        self.await_flags(AwaitFlags::USER | AwaitFlags::INIT, None)
            .map(|_| ())
    }

    fn await_flags(&self, flags: AwaitFlags, timeout: Option<Duration>) -> Result<AwaitFlags> {
        let mut selected: ArrayVec<&Flag, 2> = ArrayVec::new();
        if flags.contains(AwaitFlags::USER) {
            selected.push(&self.user_flag);
        }
        if flags.contains(AwaitFlags::INIT) {
            selected.push(&self.init_flag);
        }
        if selected.is_empty() {
            return Err(DriverError::InvalidArgument);
        }
        // A single blocking wait on the disjunction of the requested flags,
        // not one sequential wait per flag: waiting on USER then INIT in
        // turn would double the worst-case timeout and, with `timeout =
        // None`, could block forever on USER while INIT is already set.
        if !self.waiters.wait_any(&selected, timeout) {
            return Err(if timeout.is_none() {
                DriverError::Interrupted
            } else {
                DriverError::TimedOut
            });
        }
        let mut woken = AwaitFlags::empty();
        if flags.contains(AwaitFlags::USER) && self.user_flag.is_set() {
            self.user_flag.clear();
            woken |= AwaitFlags::USER;
        }
        if flags.contains(AwaitFlags::INIT) && self.init_flag.is_set() {
            self.init_flag.clear();
            woken |= AwaitFlags::INIT;
        }
        Ok(woken)
    }

    fn ssig(&self) -> Result<()> {
        let port = self.port.lock().ok_or(DriverError::NotInitialized)?;
        self.hv.notify(port);
        Ok(())
    }

    fn get_domid(&self) -> DomId {
        self.local_domid
    }

    fn release(self: Arc<Self>) {
        let role = *self.role.lock();
        match role {
            Role::Offerer => {
                if let (Some(meta), Some(grant)) = (*self.meta.lock(), *self.grant.lock()) {
                    unsafe {
                        (*meta)
                            .offerer_state
                            .store(PeerState::Closed as u8, Ordering::Release);
                    }
                    let port = *self.port.lock();
                    // Wake a peer blocked in AWAIT before tearing down
                    // (spec.md §4.1 release contract step 2).
                    if let Some(port) = port {
                        self.hv.notify(port);
                    }
                    // Can't safely end_foreign_access here: the receiver
                    // may still have this grant mapped. Defer it instead
                    // (spec.md §5 asymmetric teardown).
                    let meta_addr = meta as usize;
                    self.teardown.enqueue(grant, port, move || unsafe {
                        let meta_ptr = meta_addr as *const MetaPage;
                        PeerState::from_u8((*meta_ptr).receiver_state.load(Ordering::Acquire))
                            != Some(PeerState::Opened)
                    });
                }
            }
            Role::Receiver => {
                if let Some(meta) = *self.meta.lock() {
                    unsafe {
                        (*meta)
                            .receiver_state
                            .store(PeerState::Closed as u8, Ordering::Release);
                    }
                }
                if let Some(port) = *self.port.lock() {
                    self.hv.notify(port);
                }
                if let Some(mapping) = self.mapping.lock().take() {
                    let _ = self.hv.unmap_grant(mapping);
                }
            }
            Role::Unset => {}
        }
    }
}
