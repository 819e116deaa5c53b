//! Per-driver registry of open instances, analogous to the teacher's
//! `SCHEMES: RwLock<BTreeMap<...>>` (`scheme/mod.rs`) but keyed by an opaque
//! handle id instead of a path, since this device has no namespace to
//! multiplex — every `open()` just allocates the next id.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::RwLock;

use crate::deferred::DeferredTeardown;
use crate::hypervisor::{DomId, Hypervisor};
use crate::instance::{DeviceOps, DriverInstance};
use crate::wait::Park;

pub struct DriverRegistry<H: Hypervisor> {
    hv: Arc<H>,
    teardown: Arc<DeferredTeardown>,
    instances: RwLock<BTreeMap<u32, Arc<dyn DeviceOps>>>,
    next_id: AtomicU32,
}

impl<H: Hypervisor + 'static> DriverRegistry<H> {
    pub fn new(hv: Arc<H>) -> Self {
        Self {
            hv,
            teardown: Arc::new(DeferredTeardown::new()),
            instances: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Open a new instance (one per character-device `open()`), returning
    /// the handle id userspace addresses it by in subsequent ioctls. Sweeps
    /// the deferred-teardown list first, matching `close()` — spec.md §5
    /// has the list traversed on every open *and* close, not close alone.
    pub fn open<P: Park + 'static>(&self, park: P) -> u32 {
        self.sweep();
        let instance = DriverInstance::new(self.hv.clone(), self.teardown.clone(), park);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.instances.write().insert(id, instance);
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<dyn DeviceOps>> {
        self.instances.read().get(&id).cloned()
    }

    /// `close()`: runs the instance's release logic and drops the registry's
    /// reference to it, then opportunistically sweeps the deferred list.
    pub fn close(&self, id: u32) {
        if let Some(instance) = self.instances.write().remove(&id) {
            instance.release();
        }
        self.sweep();
    }

    /// Run a deferred-teardown sweep. Called after every `close()` and may
    /// also be invoked periodically/on idle by the embedding driver.
    pub fn sweep(&self) -> usize {
        self.teardown.sweep(&*self.hv, self.hv.local_domid())
    }

    pub fn local_domid(&self) -> DomId {
        self.hv.local_domid()
    }
}
