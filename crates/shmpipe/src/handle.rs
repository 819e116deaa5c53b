use std::sync::Arc;
use std::time::Duration;

use shmpipe_driver::{DeviceOps, DomId, DriverRegistry, Hypervisor, Park};
use shmpipe_proto::{AwaitFlags, MetaPage, PeerState, SideFlags};
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::config::{Convention, PipeConfig, Role};
use crate::error::{PipeError, Result};
use crate::ring;
use crate::stats::PipeStats;

/// One end of a shmpipe. Owns the driver-side instance handle and a raw
/// view of the mapped meta page + ring buffer.
pub struct PipeHandle {
    device: Arc<dyn DeviceOps>,
    meta: *const MetaPage,
    buffer: *mut u8,
    capacity: u32,
    role: Role,
    convention: Convention,
    granularity: usize,
    spin_iterations: u32,
    stats: PipeStats,
}

// SAFETY: `meta`/`buffer` point into memory the driver mapped for the
// lifetime of this handle; all mutation through them goes through the
// atomics `RingControl` exposes or is confined to this handle's own half
// of the buffer, so sharing the handle across threads is sound as long as
// callers don't call `read`/`write` concurrently from multiple threads (a
// single producer, single consumer each call from one thread at a time,
// matching the SPSC contract).
unsafe impl Send for PipeHandle {}
unsafe impl Sync for PipeHandle {}

impl PipeHandle {
    fn from_raw(
        device: Arc<dyn DeviceOps>,
        mapped: *mut u8,
        pages: u8,
        role: Role,
        convention: Convention,
        granularity: Option<usize>,
        spin_iterations: u32,
    ) -> Self {
        let meta = mapped as *const MetaPage;
        // One dedicated meta page plus `pages` data pages (mirrors the
        // `pages + 1` total the driver's `INIT_RECEIVER` validates against).
        let buffer_len =
            (pages as usize + 1) * shmpipe_proto::PAGE_SIZE - MetaPage::BUFFER_OFFSET;
        let buffer = unsafe { mapped.add(MetaPage::BUFFER_OFFSET) };
        let granularity = granularity.unwrap_or_else(|| core::cmp::max(1, buffer_len / 4));
        Self {
            device,
            meta,
            buffer,
            capacity: buffer_len as u32,
            role,
            convention,
            granularity,
            spin_iterations,
            stats: PipeStats::default(),
        }
    }

    fn meta(&self) -> &MetaPage {
        unsafe { &*self.meta }
    }

    fn buffer(&self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.buffer, self.capacity as usize) }
    }

    /// Open the offering side of a pipe (the side that allocates frames and
    /// grants them to `distant`). Valid only when `cfg.role` matches
    /// `cfg.convention`'s offering side.
    pub fn offer<H: Hypervisor + 'static, P: Park + 'static>(
        registry: &DriverRegistry<H>,
        cfg: PipeConfig,
        distant: DomId,
        park: P,
    ) -> Result<(Self, shmpipe_driver::GrantRef, DomId)> {
        check_offering_role(&cfg)?;
        let id = registry.open(park);
        let device = registry.get(id).expect("just opened");
        let (grant, local) = device.init_offerer(cfg.pages, distant)?;
        let ptr = device.mmap()?;
        debug!(instance = id, role = ?cfg.role, "pipe offered");
        Ok((
            Self::from_raw(
                device,
                ptr,
                cfg.pages,
                cfg.role,
                cfg.convention,
                cfg.granularity,
                cfg.spin_iterations,
            ),
            grant,
            local,
        ))
    }

    /// Open the accepting side of a pipe, given the grant reference the
    /// offering side produced (typically carried over the rendezvous
    /// protocol).
    pub fn accept<H: Hypervisor + 'static, P: Park + 'static>(
        registry: &DriverRegistry<H>,
        cfg: PipeConfig,
        distant: DomId,
        grant: shmpipe_driver::GrantRef,
        park: P,
    ) -> Result<Self> {
        check_accepting_role(&cfg)?;
        let id = registry.open(park);
        let device = registry.get(id).expect("just opened");
        device.init_receiver(cfg.pages, distant, grant)?;
        let ptr = device.mmap()?;
        debug!(instance = id, role = ?cfg.role, "pipe accepted");
        Ok(Self::from_raw(
            device,
            ptr,
            cfg.pages,
            cfg.role,
            cfg.convention,
            cfg.granularity,
            cfg.spin_iterations,
        ))
    }

    pub fn stats(&self) -> &PipeStats {
        &self.stats
    }

    fn own_flags(&self) -> &core::sync::atomic::AtomicU32 {
        match self.role {
            Role::Writer => &self.meta().ring.writer_flags,
            Role::Reader => &self.meta().ring.reader_flags,
        }
    }

    fn peer_flags(&self) -> &core::sync::atomic::AtomicU32 {
        match self.role {
            Role::Writer => &self.meta().ring.reader_flags,
            Role::Reader => &self.meta().ring.writer_flags,
        }
    }

    fn peer_closed(&self) -> bool {
        let state = match self.role {
            Role::Writer => self.meta().receiver_state.load(Ordering::Acquire),
            Role::Reader => self.meta().offerer_state.load(Ordering::Acquire),
        };
        PeerState::from_u8(state) == Some(PeerState::Closed)
    }

    /// Wake the peer if (and only if) it marked itself SLEEPING, matching
    /// the adaptive protocol: a signal is only sent when it's known to be
    /// necessary.
    fn notify_peer_if_sleeping(&self) {
        let flags = SideFlags::from_bits_truncate(self.peer_flags().load(Ordering::Acquire));
        if flags.contains(SideFlags::SLEEPING) {
            match self.device.ssig() {
                Ok(()) => self.stats.inc_ssigs(),
                Err(err) => warn!(?err, "ssig failed, peer may sleep until its poll timeout"),
            }
        }
    }

    /// Spin, then mark SLEEPING and block via AWAIT, until `ready()`
    /// reports progress or the peer has closed. Closes the lost-wakeup
    /// window by double-checking `ready()` after setting SLEEPING, before
    /// actually blocking (spec.md §4.2, §9).
    fn park_until(&self, mut ready: impl FnMut() -> bool) -> Result<()> {
        for _ in 0..self.spin_iterations {
            if ready() || self.peer_closed() {
                return Ok(());
            }
            std::hint::spin_loop();
        }
        if ready() || self.peer_closed() {
            return Ok(());
        }
        let flags = self.own_flags();
        flags.fetch_or(SideFlags::SLEEPING.bits(), Ordering::Release);
        if ready() || self.peer_closed() {
            flags.fetch_and(!SideFlags::SLEEPING.bits(), Ordering::Release);
            return Ok(());
        }
        self.stats.inc_awaits();
        match self.device.await_flags(AwaitFlags::USER, Some(Duration::from_millis(200))) {
            Ok(_) => {}
            Err(shmpipe_driver::DriverError::TimedOut) => {}
            Err(shmpipe_driver::DriverError::Interrupted) => {
                flags.fetch_and(!SideFlags::SLEEPING.bits(), Ordering::Release);
                return Err(PipeError::Interrupted);
            }
            Err(e) => return Err(e.into()),
        }
        flags.fetch_and(!SideFlags::SLEEPING.bits(), Ordering::Release);
        Ok(())
    }

    /// Write up to `buf.len()` bytes, blocking if the ring is full. Returns
    /// the number of bytes actually written (may be less than
    /// `buf.len()` on close).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.role != Role::Writer {
            return Err(PipeError::WrongRole);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let ring = &self.meta().ring;
            let write_pos = ring.write_pos.load(Ordering::Relaxed);
            let read_pos = ring.read_pos.load(Ordering::Acquire);
            let free = ring::free_to_write(write_pos, read_pos, self.capacity);
            if free > 0 {
                let n = core::cmp::min(free as usize, buf.len());
                ring::copy_into_ring(self.buffer(), write_pos, &buf[..n]);
                let new_pos = ring::advance(write_pos, n as u32, self.capacity);
                ring.write_pos.store(new_pos, Ordering::Release);
                self.stats.add_written(n);
                self.notify_peer_if_sleeping();
                return Ok(n);
            }
            if self.peer_closed() {
                return Err(PipeError::Epipe);
            }
            self.park_until(|| {
                let rp = self.meta().ring.read_pos.load(Ordering::Acquire);
                let wp = self.meta().ring.write_pos.load(Ordering::Relaxed);
                ring::free_to_write(wp, rp, self.capacity) > 0
            })?;
        }
    }

    /// Write exactly `buf.len()` bytes, chunked per spec.md §4.2: the first
    /// chunk capped at 128 bytes to get data moving immediately, the rest
    /// at `granularity`.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        let mut first = true;
        while !buf.is_empty() {
            let chunk_len = if first {
                core::cmp::min(128, buf.len())
            } else {
                core::cmp::min(self.granularity, buf.len())
            };
            first = false;
            let mut sent = 0;
            while sent < chunk_len {
                sent += self.write(&buf[sent..chunk_len])?;
            }
            buf = &buf[chunk_len..];
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes, blocking if the ring is empty.
    /// Returns `Ok(0)` once the peer has closed and every byte it wrote has
    /// been drained (EOF), not an error (spec.md §4.2).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.role != Role::Reader {
            return Err(PipeError::WrongRole);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let ring = &self.meta().ring;
            let write_pos = ring.write_pos.load(Ordering::Acquire);
            let read_pos = ring.read_pos.load(Ordering::Relaxed);
            let available = ring::used_bytes(write_pos, read_pos, self.capacity);
            if available > 0 {
                let n = core::cmp::min(available as usize, buf.len());
                ring::copy_from_ring(self.buffer(), read_pos, &mut buf[..n]);
                let new_pos = ring::advance(read_pos, n as u32, self.capacity);
                ring.read_pos.store(new_pos, Ordering::Release);
                self.stats.add_read(n);
                self.notify_peer_if_sleeping();
                return Ok(n);
            }
            if self.peer_closed() {
                return Ok(0);
            }
            self.park_until(|| {
                let wp = self.meta().ring.write_pos.load(Ordering::Acquire);
                let rp = self.meta().ring.read_pos.load(Ordering::Relaxed);
                ring::used_bytes(wp, rp, self.capacity) > 0
            })?;
        }
    }

    /// Read until `buf` is completely filled or the peer closes early.
    /// Returns the number of bytes actually read.
    pub fn read_all(&self, mut buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while !buf.is_empty() {
            let n = self.read(buf)?;
            if n == 0 {
                break;
            }
            total += n;
            buf = &mut buf[n..];
        }
        Ok(total)
    }

    /// Release the pipe: marks our side closed in the meta page and
    /// releases the driver instance. Matches spec.md's "close" contract —
    /// grant teardown itself is deferred by the driver, not done here.
    pub fn free(self) {
        self.device.release();
    }
}

fn check_offering_role(cfg: &PipeConfig) -> Result<()> {
    let ok = matches!(
        (cfg.role, cfg.convention),
        (Role::Writer, Convention::WriterOffers) | (Role::Reader, Convention::ReaderOffers)
    );
    if ok {
        Ok(())
    } else {
        Err(PipeError::WrongConvention)
    }
}

fn check_accepting_role(cfg: &PipeConfig) -> Result<()> {
    let ok = matches!(
        (cfg.role, cfg.convention),
        (Role::Reader, Convention::WriterOffers) | (Role::Writer, Convention::ReaderOffers)
    );
    if ok {
        Ok(())
    } else {
        Err(PipeError::WrongConvention)
    }
}
