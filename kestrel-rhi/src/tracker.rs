//! Device-wide allocation tracking table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use kestrel_core::collections::hashmap::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    ShaderModule,
    BindingSet,
    RenderPipeline,
    ComputePipeline,
    Event,
    Semaphore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    pub count: usize,
    pub bytes: u64,
}

/// Snapshot of the live objects of one device.
#[derive(Debug, Clone, Default)]
pub struct ResourceStats {
    kinds: HashMap<ResourceKind, KindStats>,
}

impl ResourceStats {
    pub fn get(&self, kind: ResourceKind) -> KindStats {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }

    #[inline]
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.get(kind).count
    }

    #[inline]
    pub fn bytes(&self, kind: ResourceKind) -> u64 {
        self.get(kind).bytes
    }

    pub fn total_count(&self) -> usize {
        self.kinds.values().map(|k| k.count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.kinds.values().map(|k| k.bytes).sum()
    }
}

#[derive(Debug)]
struct TrackedEntry {
    kind: ResourceKind,
    label: String,
    bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ResourceTracker {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, TrackedEntry>>,
}

impl ResourceTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(self: &Arc<Self>, kind: ResourceKind, label: &str, bytes: u64) -> TrackedAllocation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, TrackedEntry {
            kind,
            label: label.to_owned(),
            bytes,
        });
        log::trace!("track {kind:?} #{id} '{label}' ({bytes} bytes)");

        TrackedAllocation {
            tracker: self.clone(),
            id,
        }
    }

    pub(crate) fn stats(&self) -> ResourceStats {
        let mut stats = ResourceStats::default();
        for entry in self.entries.lock().values() {
            let kind = stats.kinds.entry(entry.kind).or_default();
            kind.count += 1;
            kind.bytes += entry.bytes;
        }
        stats
    }

    /// Log every live object; used when a device is destroyed with objects still alive.
    pub(crate) fn report_live(&self) {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return;
        }
        log::debug!("{} objects still alive at device shutdown", entries.len());
        for (id, entry) in entries.iter() {
            log::trace!("  {:?} #{id} '{}'", entry.kind, entry.label);
        }
    }
}

/// Tracking-table registration owned by a front-end object; removed on drop.
#[derive(Debug)]
pub(crate) struct TrackedAllocation {
    tracker: Arc<ResourceTracker>,
    id: u64,
}

impl TrackedAllocation {
    /// Whether the object was created by the device owning `tracker`.
    #[inline]
    pub(crate) fn belongs_to(&self, tracker: &Arc<ResourceTracker>) -> bool {
        Arc::ptr_eq(&self.tracker, tracker)
    }

    #[inline]
    pub(crate) fn same_device(&self, other: &TrackedAllocation) -> bool {
        Arc::ptr_eq(&self.tracker, &other.tracker)
    }
}

impl Drop for TrackedAllocation {
    fn drop(&mut self) {
        let removed = self.tracker.entries.lock().remove(&self.id);
        debug_assert!(removed.is_some(), "tracking entry #{} released twice", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_follow_handle_lifetime() {
        let tracker = ResourceTracker::new();
        let a = tracker.register(ResourceKind::Buffer, "a", 256);
        let b = tracker.register(ResourceKind::Buffer, "b", 64);
        let t = tracker.register(ResourceKind::Texture, "t", 1024);

        let stats = tracker.stats();
        assert_eq!(stats.count(ResourceKind::Buffer), 2);
        assert_eq!(stats.bytes(ResourceKind::Buffer), 320);
        assert_eq!(stats.total_bytes(), 1344);

        drop(a);
        let stats = tracker.stats();
        assert_eq!(stats.count(ResourceKind::Buffer), 1);
        assert_eq!(stats.bytes(ResourceKind::Buffer), 64);
        assert_eq!(stats.count(ResourceKind::Sampler), 0);

        assert!(b.same_device(&t));
        assert!(b.belongs_to(&tracker));
        assert!(!b.belongs_to(&ResourceTracker::new()));
    }
}
