use std::sync::atomic::{AtomicU64, Ordering};

/// Per-handle counters, cheap enough to update on every call so scenario
/// assertions ("at least one AWAIT was issued") don't need a tracing
/// subscriber wired up in tests.
#[derive(Default)]
pub struct PipeStats {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    awaits_issued: AtomicU64,
    ssigs_sent: AtomicU64,
}

impl PipeStats {
    pub(crate) fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
    pub(crate) fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }
    pub(crate) fn inc_awaits(&self) {
        self.awaits_issued.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn inc_ssigs(&self) {
        self.ssigs_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
    pub fn awaits_issued(&self) -> u64 {
        self.awaits_issued.load(Ordering::Relaxed)
    }
    pub fn ssigs_sent(&self) -> u64 {
        self.ssigs_sent.load(Ordering::Relaxed)
    }
}
