//! Same-process reference `Hypervisor`/`Park`, standing in for real grant
//! tables and event channels (feature `sim`). Two `LocalHypervisor`s built
//! from the same `LocalFabric` simulate two domains sharing host memory, the
//! way this crate's tests and `shmpipe`'s integration tests exercise the
//! offerer/receiver handshake without a hypervisor.
//!
//! Requires `std` (`Condvar`/`Mutex`/heap-backed frames), so it's only
//! compiled under `feature = "sim"` even though the rest of the crate is
//! `no_std`.

extern crate std;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crate::error::{DriverError, Result};
use crate::hypervisor::{DomId, EventPort, EventSink, Frames, GrantRef, Hypervisor, Mapping};
use crate::wait::Park;

/// A domain's locally-owned frames, boxed so the address is stable once
/// granted; `LocalFabric` keeps the grant's `Arc` alive until
/// `end_foreign_access` so a mapped receiver can keep reading through
/// teardown ordering races in tests.
pub struct LocalFrames {
    ptr: *mut u8,
    len: usize,
    _owner: Arc<Box<[u8]>>,
}

impl Frames for LocalFrames {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}

unsafe impl Send for LocalFrames {}
unsafe impl Sync for LocalFrames {}

pub struct LocalMapping {
    ptr: *mut u8,
    len: usize,
    _owner: Arc<Box<[u8]>>,
}

unsafe impl Send for LocalMapping {}

impl Mapping for LocalMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}

struct GrantEntry {
    owner: Arc<Box<[u8]>>,
}

struct PortState {
    handler: Mutex<Option<Arc<dyn EventSink>>>,
    /// The port id `notify` actually wakes. A freshly `alloc_unbound_port`'d
    /// port has no peer yet; `bind_port` cross-links the binder's new port
    /// id with the port it bound to, the way a real bound event channel has
    /// each side holding a *different* local port number for the same
    /// channel rather than sharing one id.
    peer: Mutex<Option<u32>>,
}

/// Shared state two `LocalHypervisor`s (one per simulated domain) both
/// reference, standing in for the real grant table / event-channel table a
/// hypervisor maintains out-of-band from either guest.
pub struct LocalFabric {
    grants: Mutex<BTreeMap<u32, GrantEntry>>,
    next_grant: std::sync::atomic::AtomicU32,
    ports: Mutex<BTreeMap<u32, Arc<PortState>>>,
    next_port: std::sync::atomic::AtomicU32,
}

impl LocalFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            grants: Mutex::new(BTreeMap::new()),
            next_grant: std::sync::atomic::AtomicU32::new(1),
            ports: Mutex::new(BTreeMap::new()),
            next_port: std::sync::atomic::AtomicU32::new(1),
        })
    }
}

pub struct LocalHypervisor {
    fabric: Arc<LocalFabric>,
    domid: DomId,
}

impl LocalHypervisor {
    pub fn new(fabric: Arc<LocalFabric>, domid: DomId) -> Self {
        Self { fabric, domid }
    }
}

impl Hypervisor for LocalHypervisor {
    type Frames = LocalFrames;
    type Mapping = LocalMapping;

    fn local_domid(&self) -> DomId {
        self.domid
    }

    fn alloc_frames(&self, pages: u8) -> Result<Self::Frames> {
        let len = pages as usize * shmpipe_proto::PAGE_SIZE;
        let owner: Arc<Box<[u8]>> = Arc::new(alloc::vec![0u8; len].into_boxed_slice());
        let ptr = owner.as_ptr() as *mut u8;
        Ok(LocalFrames { ptr, len, _owner: owner })
    }

    fn grant_foreign_access(&self, frames: &Self::Frames, _distant: DomId) -> Result<GrantRef> {
        let id = self.fabric.next_grant.fetch_add(1, Ordering::Relaxed);
        self.fabric.grants.lock().unwrap().insert(
            id,
            GrantEntry {
                owner: frames._owner.clone(),
            },
        );
        Ok(GrantRef(id))
    }

    fn end_foreign_access(&self, grant: GrantRef) -> Result<()> {
        self.fabric.grants.lock().unwrap().remove(&grant.0);
        Ok(())
    }

    fn map_grant(&self, grant: GrantRef, _distant: DomId, pages: u8) -> Result<Self::Mapping> {
        let grants = self.fabric.grants.lock().unwrap();
        let entry = grants.get(&grant.0).ok_or(DriverError::Hypervisor)?;
        let ptr = entry.owner.as_ptr() as *mut u8;
        let len = entry.owner.len();
        debug_assert_eq!(len, pages as usize * shmpipe_proto::PAGE_SIZE);
        Ok(LocalMapping {
            ptr,
            len,
            _owner: entry.owner.clone(),
        })
    }

    fn unmap_grant(&self, _mapping: Self::Mapping) -> Result<()> {
        Ok(())
    }

    fn alloc_unbound_port(&self, _remote: DomId) -> Result<EventPort> {
        let id = self.fabric.next_port.fetch_add(1, Ordering::Relaxed);
        self.fabric.ports.lock().unwrap().insert(
            id,
            Arc::new(PortState {
                handler: Mutex::new(None),
                peer: Mutex::new(None),
            }),
        );
        Ok(EventPort(id))
    }

    fn bind_port(&self, _remote: DomId, remote_port: EventPort) -> Result<EventPort> {
        let id = self.fabric.next_port.fetch_add(1, Ordering::Relaxed);
        let mut ports = self.fabric.ports.lock().unwrap();
        ports.insert(
            id,
            Arc::new(PortState {
                handler: Mutex::new(None),
                peer: Mutex::new(Some(remote_port.0)),
            }),
        );
        if let Some(remote_state) = ports.get(&remote_port.0) {
            *remote_state.peer.lock().unwrap() = Some(id);
        }
        Ok(EventPort(id))
    }

    fn close_port(&self, port: EventPort) -> Result<()> {
        self.fabric.ports.lock().unwrap().remove(&port.0);
        Ok(())
    }

    fn notify(&self, port: EventPort) {
        // `notify(port)` wakes whoever is bound to the *other* end of the
        // channel, not `port`'s own handler — mirroring a real event
        // channel, where raising your own port signals the peer.
        let peer_sink = {
            let ports = self.fabric.ports.lock().unwrap();
            let peer_id = ports.get(&port.0).and_then(|s| *s.peer.lock().unwrap());
            peer_id.and_then(|id| ports.get(&id).and_then(|s| s.handler.lock().unwrap().clone()))
        };
        if let Some(sink) = peer_sink {
            sink.on_event();
        }
    }

    fn set_handler(&self, port: EventPort, sink: Arc<dyn EventSink>) {
        if let Some(state) = self.fabric.ports.lock().unwrap().get(&port.0) {
            *state.handler.lock().unwrap() = Some(sink);
        }
    }
}

/// `Park` backed by a `Condvar`, so `AWAIT`/`WAIT` in tests behave like a
/// real blocked thread rather than a busy loop.
pub struct LocalPark {
    mutex: Mutex<()>,
    cv: Condvar,
    woken: AtomicBool,
}

impl LocalPark {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            woken: AtomicBool::new(false),
        }
    }
}

impl Default for LocalPark {
    fn default() -> Self {
        Self::new()
    }
}

impl Park for LocalPark {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.mutex.lock().unwrap();
        if self.woken.swap(false, Ordering::AcqRel) {
            return true;
        }
        match timeout {
            Some(d) => {
                let (g, _) = self.cv.wait_timeout(guard, d).unwrap();
                guard = g;
            }
            None => {
                guard = self.cv.wait(guard).unwrap();
            }
        }
        let _ = &guard;
        self.woken.swap(false, Ordering::AcqRel)
    }

    fn unpark(&self) {
        let _guard = self.mutex.lock().unwrap();
        self.woken.store(true, Ordering::Release);
        self.cv.notify_all();
    }
}
