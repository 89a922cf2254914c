//! The main bus device: request router, lifecycle executor and child bookkeeping.
//!
//! Any thread may call [`MainBus::dispatch`]. Lifecycle requests are only ever executed by the
//! bus's own worker thread; requests arriving on other threads are handed to it over a channel
//! and reported as pending. Non-lifecycle requests run on the calling thread unless the barrier
//! holds them, in which case they wait in the deferred queue until the worker replays them.

use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crate::backend::{AttachedDisk, Backends};
use crate::barrier::{BusFlags, QuiescenceBarrier};
use crate::config::BusConfig;
use crate::control;
use crate::deferred::DeferredQueue;
use crate::error::{BusError, Result, Status};
use crate::irp::{Irp, IrpHandle, Major, Request};
use crate::lower::LowerDevice;
use crate::memdisk;
use crate::pnp::{self, BusState, PnpState};
use crate::registry::NodeRegistry;
use crate::relations::RelationsBuilder;

enum WorkItem {
    Lifecycle(Irp),
    Replay,
    Shutdown,
}

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    lower: Mutex<Option<Arc<dyn LowerDevice>>>,
    pub(crate) barrier: QuiescenceBarrier,
    deferred: DeferredQueue,
    pub(crate) pnp: Mutex<PnpState>,
    pub(crate) registry: NodeRegistry,
    pub(crate) relations: RelationsBuilder,
    pub(crate) backends: Backends,
    work: Mutex<mpsc::Sender<WorkItem>>,
    worker_thread: OnceLock<ThreadId>,
}

impl BusInner {
    /// Routes one request by category.
    fn dispatch(&self, irp: Irp) -> Status {
        if self.barrier.is_torn_down() {
            irp.complete_with(Status::NoSuchDevice);
            return Status::NoSuchDevice;
        }

        match irp.request().major() {
            Major::Pnp => pnp::dispatch(self, irp),
            major => self.dispatch_held(irp, major),
        }
    }

    /// Runs a non-lifecycle request under the barrier, or defers it while requests are held.
    fn dispatch_held(&self, irp: Irp, major: Major) -> Status {
        let Some(_active) = self.barrier.enter() else {
            let status = self.deferred.push(irp);
            if self.barrier.is_torn_down() {
                self.fail_deferred();
                return Status::NoSuchDevice;
            }
            self.kick();
            return status;
        };

        match major {
            Major::DeviceControl => control::dispatch(self, irp),
            Major::Power | Major::SystemControl => self.pass_down(irp),
            Major::Create | Major::Close => {
                irp.complete_with(Status::Success);
                Status::Success
            }
            Major::Pnp | Major::Other(_) => {
                tracing::debug!(?major, "unsupported request category");
                irp.complete_with(Status::NotSupported);
                Status::NotSupported
            }
        }
    }

    pub(crate) fn lower(&self) -> Option<Arc<dyn LowerDevice>> {
        self.lower.lock().expect("lower device lock poisoned").clone()
    }

    pub(crate) fn detach_lower(&self) -> Option<Arc<dyn LowerDevice>> {
        self.lower.lock().expect("lower device lock poisoned").take()
    }

    /// Hands `irp` to the lower device without waiting for it.
    pub(crate) fn pass_down(&self, irp: Irp) -> Status {
        match self.lower() {
            Some(lower) => lower.dispatch(irp),
            None => {
                irp.complete_with(Status::NoSuchDevice);
                Status::NoSuchDevice
            }
        }
    }

    pub(crate) fn in_worker(&self) -> bool {
        self.worker_thread.get() == Some(&thread::current().id())
    }

    /// Hands a lifecycle request to the worker thread.
    pub(crate) fn queue_lifecycle(&self, irp: Irp) -> Status {
        let sent = self
            .work
            .lock()
            .expect("work queue lock poisoned")
            .send(WorkItem::Lifecycle(irp));
        match sent {
            Ok(()) => Status::Pending,
            Err(mpsc::SendError(item)) => {
                if let WorkItem::Lifecycle(irp) = item {
                    irp.complete_with(Status::NoSuchDevice);
                }
                Status::NoSuchDevice
            }
        }
    }

    /// Waits out in-flight non-lifecycle requests before a lifecycle request runs.
    ///
    /// On a torn-down bus the request is completed here with `NoSuchDevice` and the caller gets
    /// nothing back to touch.
    pub(crate) fn wait_for_active_irps(&self, irp: Irp) -> std::result::Result<Irp, Status> {
        match self.barrier.wait_for_active() {
            Ok(()) => Ok(irp),
            Err(err) => {
                let status = err.status();
                irp.complete_with(status);
                Err(status)
            }
        }
    }

    fn kick(&self) {
        let _ = self
            .work
            .lock()
            .expect("work queue lock poisoned")
            .send(WorkItem::Replay);
    }

    fn replay_deferred(&self) {
        while !self.barrier.is_held() {
            let Some(irp) = self.deferred.pop() else {
                break;
            };
            tracing::debug!(irp = irp.id(), "replaying deferred request");
            self.dispatch(irp);
        }
    }

    fn fail_deferred(&self) {
        for irp in self.deferred.drain() {
            irp.complete_with(Status::NoSuchDevice);
        }
    }

    /// Links `disk` under a fresh unit number. Fails once the bus has been removed.
    pub(crate) fn add_device(&self, disk: AttachedDisk) -> Result<u32> {
        let name = disk.device.name().to_string();
        let unit = self.registry.link_new(disk.device, disk.boot)?;
        tracing::info!(unit, device = %name, boot = disk.boot, "attached child device");
        Ok(unit)
    }

    /// Detaches the non-boot child carrying `unit`.
    pub(crate) fn detach_unit(&self, unit: u32) -> Result<()> {
        tracing::debug!(unit, "request to detach unit");
        let device = {
            let nodes = self.registry.lock();
            match nodes.find_by_unit(unit) {
                None => {
                    tracing::warn!(unit, "unit not found");
                    return Err(BusError::UnitNotFound(unit));
                }
                Some(node) if node.is_boot_device() => {
                    tracing::warn!(unit, "cannot detach a boot-time device");
                    return Err(BusError::BootDevice(unit));
                }
                Some(node) => node.device().clone(),
            }
        };

        // Registry lock is released; the device's detach logic may re-enter it.
        let node = self
            .registry
            .unlink(&device)
            .ok_or(BusError::UnitNotFound(unit))?;
        drop(device);
        node.destroy();
        tracing::info!(unit, "removed unit");
        Ok(())
    }
}

fn run_worker(inner: Arc<BusInner>, rx: mpsc::Receiver<WorkItem>) {
    let _ = inner.worker_thread.set(thread::current().id());

    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Lifecycle(irp) => {
                inner.dispatch(irp);
            }
            WorkItem::Replay => {}
            WorkItem::Shutdown => break,
        }
        if inner.barrier.is_torn_down() {
            break;
        }
        inner.replay_deferred();
    }

    inner.barrier.tear_down();
    for item in rx.try_iter() {
        if let WorkItem::Lifecycle(irp) = item {
            irp.complete_with(Status::NoSuchDevice);
        }
    }
    inner.fail_deferred();
    tracing::debug!("bus worker exiting");
}

/// Handle to a bus instance. Created when the driver attaches to its lower device, torn down by
/// the remove transition (or by dropping the handle).
pub struct MainBus {
    inner: Arc<BusInner>,
    worker: Option<JoinHandle<()>>,
}

impl MainBus {
    pub fn new(config: BusConfig, lower: Arc<dyn LowerDevice>) -> Result<Self> {
        Self::with_backends(config, lower, Backends::default())
    }

    pub fn with_backends(
        config: BusConfig,
        lower: Arc<dyn LowerDevice>,
        backends: Backends,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker_name = config.worker_name.clone();
        let inner = Arc::new(BusInner {
            config,
            lower: Mutex::new(Some(lower)),
            // Nothing but lifecycle requests gets through before the first start.
            barrier: QuiescenceBarrier::new(BusFlags::IRPS_HELD),
            deferred: DeferredQueue::new(),
            pnp: Mutex::new(PnpState::default()),
            registry: NodeRegistry::new(),
            relations: RelationsBuilder::new(),
            backends,
            work: Mutex::new(tx),
            worker_thread: OnceLock::new(),
        });

        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(worker_name)
                .spawn(move || run_worker(inner, rx))
                .map_err(BusError::Spawn)?
        };

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Entry point for every request sent to the bus.
    ///
    /// Returns the request's status, or `Pending` if it was queued and will be completed later.
    pub fn dispatch(&self, irp: Irp) -> Status {
        self.inner.dispatch(irp)
    }

    /// Builds a request, dispatches it and returns the handle to wait on.
    pub fn submit(&self, request: Request) -> IrpHandle {
        let (irp, handle) = Irp::new(request);
        self.dispatch(irp);
        handle
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn state(&self) -> BusState {
        self.pnp_state().state
    }

    pub fn pnp_state(&self) -> PnpState {
        *self.inner.pnp.lock().expect("pnp state lock poisoned")
    }

    pub fn flags(&self) -> BusFlags {
        self.inner.barrier.flags()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn node_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.len()
    }

    pub fn relations_rebuilds(&self) -> u64 {
        self.inner.relations.rebuild_count()
    }

    pub fn is_attached_to_lower(&self) -> bool {
        self.inner.lower().is_some()
    }

    /// Links a disk produced by a backend; returns its unit number.
    pub fn add_device(&self, disk: AttachedDisk) -> Result<u32> {
        self.inner.add_device(disk)
    }

    /// Looks for a MEMDISK table in `memory` and attaches the RAM disk it describes as a boot
    /// device.
    pub fn attach_memdisk(&self, memory: &[u8], base: u32) -> Result<Option<u32>> {
        let Some((addr, table)) = memdisk::probe(memory, base) else {
            tracing::debug!("no MEMDISK found");
            return Ok(None);
        };
        tracing::info!(
            address = format_args!("{addr:#x}"),
            sectors = table.disk_size,
            drive = table.drive_number,
            "found MEMDISK"
        );
        self.add_device(table.attached_disk()).map(Some)
    }
}

impl Drop for MainBus {
    fn drop(&mut self) {
        let _ = self
            .inner
            .work
            .lock()
            .expect("work queue lock poisoned")
            .send(WorkItem::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
