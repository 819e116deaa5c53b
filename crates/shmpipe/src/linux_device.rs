//! Real `/dev/shmpipeN` backend using `nix`'s `ioctl_*!`/`mmap` wrappers
//! instead of the in-process `DeviceOps` trait object. Gated behind the
//! `linux-device` feature since no such device node exists in this
//! environment to build or test against; kept alongside the in-process path
//! the way the pack's own syscall-backed crates gate their real I/O behind
//! a feature over a default test-friendly shim.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use shmpipe_proto::cmd;

use crate::error::{PipeError, Result};

nix::ioctl_readwrite!(init_offerer_ioctl, cmd::MAGIC, cmd::INIT_OFFERER, shmpipe_proto::InitOffererIoctl);
nix::ioctl_write_ptr!(init_receiver_ioctl, cmd::MAGIC, cmd::INIT_RECEIVER, shmpipe_proto::InitReceiverReq);
nix::ioctl_none!(wait_ioctl, cmd::MAGIC, cmd::WAIT);
nix::ioctl_readwrite!(await_ioctl, cmd::MAGIC, cmd::AWAIT, shmpipe_proto::AwaitReq);
nix::ioctl_none!(ssig_ioctl, cmd::MAGIC, cmd::SSIG);
nix::ioctl_read!(get_domid_ioctl, cmd::MAGIC, cmd::GET_DOMID, shmpipe_proto::GetDomidResp);

/// An open `/dev/shmpipeN` node plus its active mmap, wired up through the
/// same ioctl command table `shmpipe-driver` dispatches in-process.
pub struct DeviceNode {
    file: File,
    mapped: *mut u8,
    len: usize,
}

unsafe impl Send for DeviceNode {}

impl DeviceNode {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| PipeError::SetupFailed(shmpipe_driver::DriverError::Hypervisor))?;
        Ok(Self {
            file,
            mapped: core::ptr::null_mut(),
            len: 0,
        })
    }

    pub fn init_offerer(&self, pages: u8, distant_domid: u16) -> Result<(u32, u16)> {
        let mut req = shmpipe_proto::InitOffererIoctl {
            pages,
            distant_domid,
            grant_ref: 0,
            local_domid: 0,
        };
        unsafe { init_offerer_ioctl(self.file.as_raw_fd(), &mut req) }
            .map_err(|_| PipeError::SetupFailed(shmpipe_driver::DriverError::Hypervisor))?;
        Ok((req.grant_ref, req.local_domid))
    }

    pub fn init_receiver(&self, req: &shmpipe_proto::InitReceiverReq) -> Result<()> {
        unsafe { init_receiver_ioctl(self.file.as_raw_fd(), req) }
            .map(|_| ())
            .map_err(|_| PipeError::SetupFailed(shmpipe_driver::DriverError::Hypervisor))
    }

    pub fn mmap_region(&mut self, pages: u8) -> Result<*mut u8> {
        self.len = pages as usize * shmpipe_proto::PAGE_SIZE;
        let addr = unsafe {
            mmap(
                None,
                core::num::NonZeroUsize::new(self.len).expect("non-zero page count"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.file,
                0,
            )
        }
        .map_err(|_| PipeError::SetupFailed(shmpipe_driver::DriverError::Hypervisor))?;
        self.mapped = addr.as_ptr() as *mut u8;
        Ok(self.mapped)
    }

    pub fn ssig(&self) -> Result<()> {
        unsafe { ssig_ioctl(self.file.as_raw_fd()) }
            .map(|_| ())
            .map_err(|_| PipeError::SetupFailed(shmpipe_driver::DriverError::Hypervisor))
    }
}
