//! Bus-management core of a virtual block-device driver stack.
//!
//! [`MainBus`] represents the root bus device: it routes requests by category, runs the
//! lifecycle state machine on a dedicated worker thread, holds non-lifecycle requests behind a
//! quiescence barrier during destructive transitions and keeps the registry of child disks
//! reported in bus relations.

#![forbid(unsafe_code)]

pub mod backend;
pub mod barrier;
mod bus;
pub mod config;
pub mod control;
pub mod deferred;
pub mod device;
pub mod error;
pub mod irp;
pub mod lower;
pub mod memdisk;
pub mod pnp;
pub mod registry;
pub mod relations;

pub use backend::{AttachBackend, AttachedDisk, Backends, DummyBackend, FileBackend};
pub use barrier::BusFlags;
pub use bus::MainBus;
pub use config::{BusConfig, PnpBusInformation};
pub use device::{DeviceRef, DiskKind};
pub use error::{BusError, Result, Status};
pub use irp::{
    CompletedIrp, DeviceControlRequest, Information, Irp, IrpHandle, PnpMinor, RelationType,
    Request,
};
pub use lower::{LowerDevice, RootPdo};
pub use pnp::{BusState, PnpState};
pub use relations::DeviceRelations;
