//! Lifecycle ("PnP") state machine.
//!
//! Only the bus worker thread runs [`dispatch`]'s handlers; lifecycle requests arriving on any
//! other thread are queued to it first.

use crate::barrier::BusFlags;
use crate::bus::BusInner;
use crate::error::{BusError, Status};
use crate::irp::{DeviceTextType, Information, Irp, PnpMinor, RelationType, Request};
use crate::relations::Merge;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusState {
    #[default]
    NotStarted,
    Started,
    StopPending,
    Stopped,
    RemovePending,
    SurpriseRemovePending,
    Removed,
}

/// Current state plus the one saved on entering a `*Pending` state, so a cancel can put it back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PnpState {
    pub state: BusState,
    pub previous: BusState,
}

impl PnpState {
    pub fn enter(&mut self, next: BusState) {
        self.previous = self.state;
        self.state = next;
    }

    pub fn restore(&mut self) {
        self.state = self.previous;
    }
}

pub(crate) fn dispatch(bus: &BusInner, irp: Irp) -> Status {
    if !bus.in_worker() {
        tracing::debug!(irp = irp.id(), request = ?irp.request(), "queueing lifecycle request");
        return bus.queue_lifecycle(irp);
    }

    let Request::Pnp(minor) = *irp.request() else {
        irp.complete_with(Status::NotSupported);
        return Status::NotSupported;
    };
    tracing::debug!(irp = irp.id(), ?minor, "lifecycle request");

    match minor {
        PnpMinor::QueryDeviceText(kind) => query_device_text(bus, irp, kind),
        PnpMinor::QueryBusInformation => query_bus_information(bus, irp),
        PnpMinor::QueryCapabilities => bus.pass_down(irp),
        PnpMinor::QueryDeviceRelations(RelationType::Bus) => query_bus_relations(bus, irp),
        PnpMinor::QueryDeviceRelations(_) => bus.pass_down(irp),
        PnpMinor::RemoveDevice => remove_device(bus, irp),
        PnpMinor::StartDevice => start_device(bus, irp),
        PnpMinor::QueryPnpDeviceState => {
            let mut irp = irp;
            irp.set_information(Information::None);
            irp.set_status(Status::Success);
            bus.pass_down(irp)
        }
        PnpMinor::QueryStopDevice => hold(bus, irp, BusState::StopPending),
        PnpMinor::StopDevice => hold(bus, irp, BusState::Stopped),
        PnpMinor::QueryRemoveDevice => hold(bus, irp, BusState::RemovePending),
        PnpMinor::SurpriseRemoval => hold(bus, irp, BusState::SurpriseRemovePending),
        PnpMinor::CancelStopDevice | PnpMinor::CancelRemoveDevice => release(bus, irp),
        PnpMinor::QueryResources | PnpMinor::QueryResourceRequirements => bus.pass_down(irp),
        PnpMinor::Other(code) => {
            tracing::debug!(minor = code, "unhandled lifecycle minor, passing down");
            bus.pass_down(irp)
        }
    }
}

fn set_state(bus: &BusInner, next: BusState) {
    let mut pnp = bus.pnp.lock().expect("pnp state lock poisoned");
    pnp.enter(next);
    tracing::info!(from = ?pnp.previous, to = ?pnp.state, "bus state change");
}

fn query_device_text(bus: &BusInner, mut irp: Irp, kind: DeviceTextType) -> Status {
    let status = match kind {
        DeviceTextType::Description => match wide_text(&bus.config.device_text()) {
            Ok(text) => {
                irp.set_information(Information::Text(text));
                Status::Success
            }
            Err(err) => {
                tracing::warn!(%err, "could not allocate device text");
                err.status()
            }
        },
        _ => Status::NotSupported,
    };
    irp.complete_with(status);
    status
}

/// NUL-terminated UTF-16 copy of `text`.
fn wide_text(text: &str) -> Result<Vec<u16>, BusError> {
    let units = text.encode_utf16().count() + 1;
    let mut wide = Vec::new();
    wide.try_reserve_exact(units)?;
    wide.extend(text.encode_utf16());
    wide.push(0);
    Ok(wide)
}

fn query_bus_information(bus: &BusInner, mut irp: Irp) -> Status {
    irp.set_information(Information::BusInformation(bus.config.bus_information));
    irp.complete_with(Status::Success);
    Status::Success
}

fn query_bus_relations(bus: &BusInner, mut irp: Irp) -> Status {
    let upstream = match irp.take_information() {
        Information::Relations(relations) => Some(relations),
        other => {
            irp.set_information(other);
            None
        }
    };

    match bus.relations.merge(&bus.registry, upstream) {
        Merge::Merged(relations) => {
            irp.set_information(Information::Relations(relations));
            irp.set_status(Status::Success);
            bus.pass_down(irp)
        }
        Merge::Unchanged(upstream) => {
            if let Some(upstream) = upstream {
                irp.set_information(Information::Relations(upstream));
            }
            bus.pass_down(irp)
        }
        Merge::Failed(err, upstream) => {
            tracing::warn!(%err, "could not build bus relations");
            if let Some(upstream) = upstream {
                irp.set_information(Information::Relations(upstream));
            }
            let status = err.status();
            irp.complete_with(status);
            status
        }
    }
}

fn remove_device(bus: &BusInner, irp: Irp) -> Status {
    // Held before draining: nothing new gets in while in-flight requests finish.
    bus.barrier.raise();
    let Ok(irp) = bus.wait_for_active_irps(irp) else {
        return Status::NoSuchDevice;
    };

    bus.relations.clear();

    let nodes = bus.registry.drain();
    let removed = nodes.len();
    for node in nodes {
        node.destroy();
    }
    set_state(bus, BusState::Removed);

    bus.detach_lower();
    bus.barrier.tear_down();
    tracing::info!(children = removed, "bus removed");

    irp.complete_with(Status::Success);
    Status::Success
}

fn start_device(bus: &BusInner, irp: Irp) -> Status {
    let before = bus.barrier.raise();
    let Ok(irp) = bus.wait_for_active_irps(irp) else {
        return Status::NoSuchDevice;
    };
    let restore_flags = || {
        if !before.contains(BusFlags::IRPS_HELD) {
            bus.barrier.lower();
        }
    };
    let Some(lower) = bus.lower() else {
        restore_flags();
        irp.complete_with(Status::NoSuchDevice);
        return Status::NoSuchDevice;
    };

    let Some(irp) = irp.forward_and_wait(&*lower) else {
        tracing::warn!("lower device lost the start request");
        restore_flags();
        return Status::Cancelled;
    };

    let status = irp.status();
    if !status.is_success() {
        tracing::warn!(?status, "lower device failed to start");
        restore_flags();
        irp.complete();
        return status;
    }

    set_state(bus, BusState::Started);
    bus.barrier.lower();
    irp.complete_with(Status::Success);
    Status::Success
}

/// Enters a pending or stopped state and raises the barrier.
fn hold(bus: &BusInner, irp: Irp, next: BusState) -> Status {
    set_state(bus, next);
    bus.barrier.raise();
    irp.complete_with(Status::Success);
    Status::Success
}

/// Cancels a pending stop or remove: restores the saved state and lowers the barrier.
fn release(bus: &BusInner, irp: Irp) -> Status {
    {
        let mut pnp = bus.pnp.lock().expect("pnp state lock poisoned");
        pnp.restore();
        tracing::info!(state = ?pnp.state, "restored bus state");
    }
    bus.barrier.lower();
    irp.complete_with(Status::Success);
    Status::Success
}
