//! Deferred teardown list (spec.md §5 "Asymmetric teardown", §9 "Global
//! state").
//!
//! An offerer can't revoke a grant the instant its local handle closes: the
//! receiver may still hold it mapped, and unmapping out from under a live
//! mapping is undefined on real hardware. Closing an offerer instead
//! enqueues the teardown here; a sweep only actually ends the grant once the
//! meta page shows the peer has moved past `Opened`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::hypervisor::{DomId, EventPort, GrantRef, Hypervisor};

/// One offerer-side resource still waiting for its peer to let go.
struct Pending {
    grant: GrantRef,
    port: Option<EventPort>,
    /// True once the peer's `PeerState` has been observed as `Closed` (or
    /// never reached `Opened` at all, e.g. the peer crashed before mapping).
    peer_done: Box<dyn Fn() -> bool + Send>,
}

/// Single-mutex-guarded list, matching spec.md's choice of one global lock
/// over the deferred set rather than per-entry locking — teardown is rare
/// and never latency sensitive, so contention isn't a design concern here.
pub struct DeferredTeardown {
    pending: Mutex<Vec<Pending>>,
}

impl DeferredTeardown {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a grant (and optionally the event channel it was paired with)
    /// for teardown once `peer_done` reports the peer will never map it
    /// again.
    pub fn enqueue(
        &self,
        grant: GrantRef,
        port: Option<EventPort>,
        peer_done: impl Fn() -> bool + Send + 'static,
    ) {
        self.pending.lock().push(Pending {
            grant,
            port,
            peer_done: Box::new(peer_done),
        });
    }

    /// Attempt to end every entry whose peer has released the mapping.
    /// Entries still pending stay queued for the next sweep. Returns the
    /// number of entries actually torn down.
    pub fn sweep<H: Hypervisor>(&self, hv: &H, _local: DomId) -> usize {
        let mut pending = self.pending.lock();
        let mut done = 0;
        let mut i = 0;
        while i < pending.len() {
            if (pending[i].peer_done)() {
                let entry = pending.swap_remove(i);
                let _ = hv.end_foreign_access(entry.grant);
                if let Some(port) = entry.port {
                    let _ = hv.close_port(port);
                }
                done += 1;
            } else {
                i += 1;
            }
        }
        done
    }

    /// Number of entries still awaiting teardown, for tests/diagnostics.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeferredTeardown {
    fn default() -> Self {
        Self::new()
    }
}
