#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vblk_bus::{
    BusConfig, CompletedIrp, DeviceRef, DiskKind, Irp, IrpHandle, LowerDevice, MainBus, PnpMinor,
    Request, RootPdo, Status,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Lower device that behaves like [`RootPdo`], records every non-lifecycle request it sees and
/// can be told to fail start-device.
#[derive(Default)]
pub struct RecordingLower {
    pub seen: Mutex<Vec<u64>>,
    fail_start: Mutex<Option<Status>>,
    pdo: RootPdo,
}

impl RecordingLower {
    pub fn failing_start(status: Status) -> Self {
        let lower = Self::default();
        lower.fail_starts_with(Some(status));
        lower
    }

    pub fn fail_starts_with(&self, status: Option<Status>) {
        *self.fail_start.lock().unwrap() = status;
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

impl LowerDevice for RecordingLower {
    fn dispatch(&self, irp: Irp) -> Status {
        let request = irp.request().clone();
        let fail_start = *self.fail_start.lock().unwrap();
        match (request, fail_start) {
            (Request::Pnp(PnpMinor::StartDevice), Some(status)) => {
                irp.complete_with(status);
                return status;
            }
            (Request::Pnp(_), _) => {}
            _ => self.seen.lock().unwrap().push(irp.id()),
        }
        self.pdo.dispatch(irp)
    }
}

pub fn bus_on(lower: Arc<RecordingLower>) -> MainBus {
    MainBus::new(BusConfig::default(), lower).expect("bus worker spawns")
}

pub fn new_bus() -> (MainBus, Arc<RecordingLower>) {
    let lower = Arc::new(RecordingLower::default());
    (bus_on(Arc::clone(&lower)), lower)
}

pub fn wait(handle: &IrpHandle) -> CompletedIrp {
    handle
        .wait_timeout(TIMEOUT)
        .expect("request completed in time")
}

pub fn pnp(bus: &MainBus, minor: PnpMinor) -> CompletedIrp {
    wait(&bus.submit(Request::Pnp(minor)))
}

pub fn start(bus: &MainBus) {
    assert_eq!(pnp(bus, PnpMinor::StartDevice).status, Status::Success);
}

pub fn disk(name: &str) -> DeviceRef {
    DeviceRef::new(name, DiskKind::Dummy { size_bytes: 1 << 20 })
}
