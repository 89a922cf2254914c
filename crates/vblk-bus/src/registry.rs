//! Child device records ("bus nodes") keyed by unit number.
//!
//! A single mutex guards every mutation and iteration. Callers must drop any [`RegistryGuard`]
//! before running logic that can re-enter the registry (e.g. a device's own detach path).

use std::sync::{Mutex, MutexGuard};

use crate::device::DeviceRef;
use crate::error::{BusError, Result};

/// Registry entry linking a unit number to a child device.
#[derive(Debug)]
pub struct BusNode {
    unit: u32,
    device: DeviceRef,
    boot: bool,
    linked: bool,
}

impl BusNode {
    pub fn new(unit: u32, device: DeviceRef, boot: bool) -> Self {
        Self {
            unit,
            device,
            boot,
            linked: false,
        }
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Boot devices can only leave the bus through full bus teardown.
    pub fn is_boot_device(&self) -> bool {
        self.boot
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Drops the registry's reference and runs the device's detach logic.
    pub(crate) fn destroy(self) {
        debug_assert!(!self.linked, "destroying a linked node");
        self.device.mark_removed();
    }
}

/// What a lookup reports about a linked node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub unit: u32,
    pub device: DeviceRef,
    pub boot: bool,
}

#[derive(Debug, Default)]
pub struct Nodes {
    nodes: Vec<BusNode>,
    count: usize,
    /// Set by [`NodeRegistry::drain`]; nothing links after teardown.
    closed: bool,
}

impl Nodes {
    fn check(&self) {
        assert_eq!(self.count, self.nodes.len(), "bus node count out of sync");
        assert!(self.nodes.iter().all(|n| n.linked), "unlinked node left in the registry");
    }

    fn free_unit(&self) -> u32 {
        let mut units: Vec<u32> = self.nodes.iter().map(|n| n.unit).collect();
        units.sort_unstable();
        let mut candidate = 0;
        for unit in units {
            if unit != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }
}

/// Locked view of the registry.
pub struct RegistryGuard<'a>(MutexGuard<'a, Nodes>);

impl RegistryGuard<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &BusNode> + '_ {
        self.0.nodes.iter()
    }

    /// First linked node carrying `unit`.
    pub fn find_by_unit(&self, unit: u32) -> Option<&BusNode> {
        self.0.nodes.iter().find(|n| n.unit == unit)
    }

    pub fn count(&self) -> usize {
        self.0.count
    }
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<Nodes>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard(self.inner.lock().expect("bus node lock poisoned"))
    }

    pub fn count(&self) -> usize {
        self.lock().count()
    }

    /// Appends `node`. Fails if its unit number is already linked.
    pub fn link(&self, mut node: BusNode) -> Result<()> {
        let mut nodes = self.lock();
        if nodes.0.closed {
            return Err(BusError::NoSuchDevice);
        }
        if nodes.find_by_unit(node.unit).is_some() {
            return Err(BusError::DuplicateUnit(node.unit));
        }
        node.linked = true;
        nodes.0.nodes.push(node);
        nodes.0.count += 1;
        nodes.0.check();
        Ok(())
    }

    /// Links `device` under the lowest unit number not currently in use.
    ///
    /// Fails with [`BusError::NoSuchDevice`] once the registry has been drained.
    pub fn link_new(&self, device: DeviceRef, boot: bool) -> Result<u32> {
        let mut nodes = self.lock();
        if nodes.0.closed {
            return Err(BusError::NoSuchDevice);
        }
        let unit = nodes.0.free_unit();
        nodes.0.nodes.push(BusNode {
            unit,
            device,
            boot,
            linked: true,
        });
        nodes.0.count += 1;
        nodes.0.check();
        Ok(unit)
    }

    /// Removes the node referring to `device` (by identity) and hands it back unlinked.
    pub fn unlink(&self, device: &DeviceRef) -> Option<BusNode> {
        let mut nodes = self.lock();
        let index = nodes.0.nodes.iter().position(|n| n.device.same_device(device))?;
        let mut node = nodes.0.nodes.remove(index);
        node.linked = false;
        nodes.0.count -= 1;
        nodes.0.check();
        Some(node)
    }

    pub fn find_by_unit(&self, unit: u32) -> Option<NodeInfo> {
        self.lock().find_by_unit(unit).map(|n| NodeInfo {
            unit: n.unit,
            device: n.device.clone(),
            boot: n.boot,
        })
    }

    /// Counted references to every linked device, in link order.
    pub fn snapshot(&self) -> Result<Vec<DeviceRef>> {
        let nodes = self.lock();
        let mut devices = Vec::new();
        devices.try_reserve_exact(nodes.count())?;
        devices.extend(nodes.iter().map(|n| n.device.clone()));
        Ok(devices)
    }

    /// Unlinks every node and closes the registry. Only used by full bus teardown.
    pub fn drain(&self) -> Vec<BusNode> {
        let mut nodes = self.lock();
        let mut drained = std::mem::take(&mut nodes.0.nodes);
        nodes.0.count = 0;
        nodes.0.closed = true;
        for node in &mut drained {
            node.linked = false;
        }
        drained
    }
}
