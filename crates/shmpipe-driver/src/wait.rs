//! Self-contained wait queue for `WAIT`/`AWAIT`.
//!
//! A simplified re-derivation of the teacher's `OptimizedWaitQueue`: same
//! fast-path-dequeue / `has_waiters` flag / double-check-before-block shape,
//! but parking is delegated to an injected `Park` implementation instead of
//! `context::switch`, since this crate has no scheduler to switch into.
//!
//! `AWAIT` can be asked to wait on more than one flag at once (spec.md §6:
//! "WAIT is AWAIT with flags = USER|INIT"), so flags can't each own an
//! independent `Park` the way a single-flag wait queue would — two separate
//! condvars can't be waited on disjunctively. Instead every flag on an
//! instance parks through one shared `Park`, and `Flag` is just the
//! `AtomicBool` a signaller sets before waking it.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

/// Blocking primitive the driver parks on. `LocalPark` (feature `sim`)
/// backs this with a `Condvar`; a real driver would park the calling
/// thread/task through whatever primitive its kernel exposes.
pub trait Park: Send + Sync {
    /// Block the calling thread until `unpark` is called on the same
    /// instance, or `timeout` elapses. Returns `true` if woken, `false` on
    /// timeout. `None` means block indefinitely.
    fn park(&self, timeout: Option<Duration>) -> bool;

    fn unpark(&self);
}

/// One flag bit, set by a signaller and observed by a waiter parked on a
/// shared `WaitGroup`. Used for both the AWAIT wake-reason flags and the
/// ring's WAITING/SLEEPING handshake.
pub struct Flag {
    set: AtomicBool,
}

impl Flag {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    fn mark(&self) {
        self.set.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

/// Several `Flag`s parked on one shared `Park`. Signalling any flag wakes
/// whoever is blocked on their disjunction, closing the "block on USER,
/// miss a signal on INIT" gap a per-flag `Park` would otherwise leave.
pub struct WaitGroup<P: Park> {
    park: P,
}

impl<P: Park> WaitGroup<P> {
    pub const fn new(park: P) -> Self {
        Self { park }
    }

    /// Set `flag` and wake a waiter parked on this group, if any.
    pub fn signal(&self, flag: &Flag) {
        flag.mark();
        self.park.unpark();
    }

    /// Block until any flag in `flags` is set, or `timeout` elapses.
    /// Double-checks before parking to close the lost-wakeup window between
    /// the fast-path check and actually parking. A wakeup can be spurious
    /// from this call's point of view (some other flag sharing the same
    /// `Park` fired); on a spurious wakeup this re-parks with the original
    /// `timeout` rather than a shrunk remaining duration, since `Park`
    /// doesn't report how long it actually blocked — worst-case latency
    /// under repeated spurious wakeups is a small multiple of `timeout`
    /// rather than exactly `timeout`, which is the trade this crate makes
    /// for not needing a wall clock.
    pub fn wait_any(&self, flags: &[&Flag], timeout: Option<Duration>) -> bool {
        loop {
            if flags.iter().any(|f| f.is_set()) {
                return true;
            }
            if !self.park.park(timeout) {
                return flags.iter().any(|f| f.is_set());
            }
        }
    }
}
