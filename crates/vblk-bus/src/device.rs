//! Child device identities and the shared-ownership handle used to reference them.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Backend flavour of a child disk. The data path itself lives outside the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskKind {
    File { path: PathBuf, size_bytes: u64 },
    Memory { disk_buf: u32, sectors: u32 },
    Dummy { size_bytes: u64 },
}

/// A child device object. Only reachable through [`DeviceRef`].
pub struct DeviceObject {
    id: u64,
    name: String,
    kind: DiskKind,
    removed: AtomicBool,
}

impl fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl DeviceObject {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DiskKind {
        &self.kind
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// Counted reference to a [`DeviceObject`].
///
/// Cloning is the reference increment and dropping the decrement; there is no other way to
/// touch the count, so every increment has exactly one matching release.
#[derive(Clone)]
pub struct DeviceRef(Arc<DeviceObject>);

impl DeviceRef {
    pub fn new(name: impl Into<String>, kind: DiskKind) -> Self {
        Self(Arc::new(DeviceObject {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind,
            removed: AtomicBool::new(false),
        }))
    }

    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Identity comparison (same device object, not equal contents).
    pub fn same_device(&self, other: &DeviceRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Runs the device's own detach logic once its node has left the bus.
    pub(crate) fn mark_removed(&self) {
        self.0.removed.store(true, Ordering::Release);
    }
}

impl std::ops::Deref for DeviceRef {
    type Target = DeviceObject;

    fn deref(&self) -> &DeviceObject {
        &self.0
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRef({}#{})", self.0.name, self.0.id)
    }
}
