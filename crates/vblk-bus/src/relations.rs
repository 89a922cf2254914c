//! Bus-relations snapshots: the list of children reported to the framework.
//!
//! The cached snapshot is cleared right after every use, so each bus-relations query rebuilds
//! it from the registry and the framework always receives a fresh object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::device::DeviceRef;
use crate::error::BusError;
use crate::registry::NodeRegistry;

/// Count + flat array of counted device references. Owned by whoever holds it; dropping it
/// releases every reference it carries.
#[derive(Debug, Default)]
pub struct DeviceRelations {
    objects: Vec<DeviceRef>,
}

impl DeviceRelations {
    pub fn new(objects: Vec<DeviceRef>) -> Self {
        Self { objects }
    }

    pub fn count(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> &[DeviceRef] {
        &self.objects
    }

    pub fn into_objects(self) -> Vec<DeviceRef> {
        self.objects
    }
}

/// Outcome of merging the bus's own children with relations supplied from above.
#[derive(Debug)]
pub enum Merge {
    /// A new snapshot to attach to the request before passing it down.
    Merged(DeviceRelations),
    /// Nothing of our own to add; the upstream relations (if any) go back on the request.
    Unchanged(Option<DeviceRelations>),
    /// Building the snapshot failed; the upstream relations go back on the request.
    Failed(BusError, Option<DeviceRelations>),
}

#[derive(Debug, Default)]
pub struct RelationsBuilder {
    cached: Mutex<Option<DeviceRelations>>,
    rebuilds: AtomicU64,
}

impl RelationsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the snapshot was rebuilt from the registry.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Builds the bus-relations answer: own linked children first, then `upstream`.
    pub fn merge(&self, registry: &NodeRegistry, upstream: Option<DeviceRelations>) -> Merge {
        let own = {
            let mut cached = self.cached.lock().expect("relations lock poisoned");
            if cached.is_none() {
                match registry.snapshot() {
                    Ok(devices) => {
                        self.rebuilds.fetch_add(1, Ordering::Relaxed);
                        *cached = Some(DeviceRelations::new(devices));
                    }
                    Err(err) => return Merge::Failed(err, upstream),
                }
            }
            // Invalidated after every use; the next query rebuilds.
            cached.take().unwrap_or_default()
        };

        if own.count() == 0 {
            return Merge::Unchanged(upstream);
        }

        let upstream_count = upstream.as_ref().map_or(0, DeviceRelations::count);
        let mut objects = Vec::new();
        if let Err(err) = objects.try_reserve_exact(own.count() + upstream_count) {
            return Merge::Failed(err.into(), upstream);
        }
        objects.extend(own.into_objects());
        if let Some(upstream) = upstream {
            objects.extend(upstream.into_objects());
        }

        tracing::debug!(
            count = objects.len(),
            upstream = upstream_count,
            "built bus relations"
        );
        Merge::Merged(DeviceRelations::new(objects))
    }

    /// Drops any cached snapshot, releasing its references.
    pub fn clear(&self) {
        self.cached.lock().expect("relations lock poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DiskKind;

    fn disk(name: &str) -> DeviceRef {
        DeviceRef::new(name, DiskKind::Dummy { size_bytes: 512 })
    }

    #[test]
    fn empty_registry_without_upstream_is_unchanged() {
        let builder = RelationsBuilder::new();
        let reg = NodeRegistry::new();
        assert!(matches!(builder.merge(&reg, None), Merge::Unchanged(None)));
    }

    #[test]
    fn empty_registry_hands_upstream_back() {
        let builder = RelationsBuilder::new();
        let reg = NodeRegistry::new();
        let other = disk("other");
        let upstream = DeviceRelations::new(vec![other.clone()]);

        match builder.merge(&reg, Some(upstream)) {
            Merge::Unchanged(Some(back)) => {
                assert_eq!(back.count(), 1);
                assert!(back.objects()[0].same_device(&other));
            }
            other => panic!("unexpected merge outcome: {other:?}"),
        }
    }

    #[test]
    fn own_children_come_before_upstream() {
        let builder = RelationsBuilder::new();
        let reg = NodeRegistry::new();
        let a = disk("a");
        let b = disk("b");
        let up = disk("up");
        reg.link_new(a.clone(), false).unwrap();
        reg.link_new(b.clone(), false).unwrap();

        let Merge::Merged(rel) = builder.merge(&reg, Some(DeviceRelations::new(vec![up.clone()])))
        else {
            panic!("expected a merged snapshot");
        };
        assert_eq!(rel.count(), 3);
        assert!(rel.objects()[0].same_device(&a));
        assert!(rel.objects()[1].same_device(&b));
        assert!(rel.objects()[2].same_device(&up));

        // Test handle + registry + snapshot.
        assert_eq!(a.ref_count(), 3);
        // Upstream references move into the snapshot without a new increment.
        assert_eq!(up.ref_count(), 2);
    }

    #[test]
    fn every_query_rebuilds() {
        let builder = RelationsBuilder::new();
        let reg = NodeRegistry::new();
        reg.link_new(disk("a"), false).unwrap();

        let first = builder.merge(&reg, None);
        let second = builder.merge(&reg, None);
        assert!(matches!(first, Merge::Merged(_)));
        assert!(matches!(second, Merge::Merged(_)));
        assert_eq!(builder.rebuild_count(), 2);
    }
}
