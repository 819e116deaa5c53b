//! Privileged half of shmpipe: owns grant/event-channel lifecycle and
//! dispatches the character device's ioctl surface
//! (`INIT_OFFERER`/`INIT_RECEIVER`/mmap/`WAIT`/`AWAIT`/`SSIG`/`GET_DOMID`/
//! release). `no_std` since this runs below the privilege boundary the rest
//! of shmpipe assumes a normal process; `alloc` is required for the
//! instance registry and deferred-teardown list.

#![no_std]

extern crate alloc;

pub mod deferred;
pub mod error;
pub mod hypervisor;
pub mod instance;
pub mod registry;
pub mod wait;

#[cfg(feature = "sim")]
pub mod local;

pub use error::{DriverError, Result};
pub use hypervisor::{DomId, EventPort, EventSink, Frames, GrantRef, Hypervisor, Mapping};
pub use instance::DeviceOps;
pub use registry::DriverRegistry;
pub use wait::Park;

#[cfg(all(test, feature = "sim"))]
mod tests {
    use alloc::sync::Arc;
    use core::time::Duration;

    use shmpipe_proto::AwaitFlags;

    use crate::local::{LocalFabric, LocalHypervisor, LocalPark};
    use crate::registry::DriverRegistry;

    fn domid(n: u16) -> crate::DomId {
        crate::DomId(n)
    }

    #[test]
    fn offerer_and_receiver_reach_mapped_stage() {
        let fabric = LocalFabric::new();
        let offerer_hv = Arc::new(LocalHypervisor::new(fabric.clone(), domid(1)));
        let receiver_hv = Arc::new(LocalHypervisor::new(fabric.clone(), domid(2)));

        let offerer_reg = DriverRegistry::new(offerer_hv);
        let receiver_reg = DriverRegistry::new(receiver_hv);

        let offerer_id = offerer_reg.open(LocalPark::new());
        let offerer = offerer_reg.get(offerer_id).unwrap();
        let (grant, local) = offerer.init_offerer(1, domid(2)).unwrap();
        assert_eq!(local, domid(1));

        let receiver_id = receiver_reg.open(LocalPark::new());
        let receiver = receiver_reg.get(receiver_id).unwrap();
        receiver.init_receiver(1, domid(1), grant).unwrap();

        assert!(!offerer.mmap().unwrap().is_null());
        assert!(!receiver.mmap().unwrap().is_null());
    }

    #[test]
    fn await_times_out_with_no_signal() {
        let fabric = LocalFabric::new();
        let hv = Arc::new(LocalHypervisor::new(fabric, domid(1)));
        let reg = DriverRegistry::new(hv);
        let id = reg.open(LocalPark::new());
        let instance = reg.get(id).unwrap();
        let err = instance
            .await_flags(AwaitFlags::USER, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert_eq!(err, crate::DriverError::TimedOut);
    }

    #[test]
    fn close_defers_grant_teardown_until_receiver_closes() {
        let fabric = LocalFabric::new();
        let offerer_hv = Arc::new(LocalHypervisor::new(fabric.clone(), domid(1)));
        let receiver_hv = Arc::new(LocalHypervisor::new(fabric.clone(), domid(2)));
        let offerer_reg = DriverRegistry::new(offerer_hv);
        let receiver_reg = DriverRegistry::new(receiver_hv);

        let offerer_id = offerer_reg.open(LocalPark::new());
        let (grant, _) = offerer_reg
            .get(offerer_id)
            .unwrap()
            .init_offerer(1, domid(2))
            .unwrap();

        let receiver_id = receiver_reg.open(LocalPark::new());
        receiver_reg
            .get(receiver_id)
            .unwrap()
            .init_receiver(1, domid(1), grant)
            .unwrap();

        offerer_reg.close(offerer_id);
        assert_eq!(offerer_reg.sweep(), 0, "receiver hasn't closed yet");

        receiver_reg.close(receiver_id);
        assert_eq!(offerer_reg.sweep(), 1, "now the grant can be ended");
    }
}
