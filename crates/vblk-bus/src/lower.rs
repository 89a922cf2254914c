//! The device immediately below the bus in the stack.

use crate::error::Status;
use crate::irp::{DeviceCapabilities, Information, Irp, PnpMinor, Request};

/// Receives requests passed down by the bus.
///
/// Implementations must complete every request they receive exactly once, either before
/// returning or later from any thread.
pub trait LowerDevice: Send + Sync {
    fn dispatch(&self, irp: Irp) -> Status;
}

/// Root-enumerated physical device object the bus is attached to when nothing else sits below
/// it.
///
/// Completes the start/stop/remove family with success, answers capability queries with
/// `capabilities` and otherwise leaves the status the upper layer set untouched.
#[derive(Debug, Default)]
pub struct RootPdo {
    pub capabilities: DeviceCapabilities,
}

impl LowerDevice for RootPdo {
    fn dispatch(&self, mut irp: Irp) -> Status {
        let status = match irp.request() {
            Request::Pnp(minor) => match minor {
                PnpMinor::StartDevice
                | PnpMinor::QueryStopDevice
                | PnpMinor::StopDevice
                | PnpMinor::CancelStopDevice
                | PnpMinor::QueryRemoveDevice
                | PnpMinor::CancelRemoveDevice
                | PnpMinor::RemoveDevice
                | PnpMinor::SurpriseRemoval => Status::Success,
                PnpMinor::QueryCapabilities => {
                    irp.set_information(Information::Capabilities(self.capabilities));
                    Status::Success
                }
                _ => irp.status(),
            },
            Request::Power(_) | Request::SystemControl => Status::Success,
            _ => irp.status(),
        };
        irp.complete_with(status);
        status
    }
}
