use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::access::AccessFlags;
use crate::error::{Result, TrackerError};
use crate::object::{
    CategoryId, TrackedObject, TrackedObjectFactory, TrackedObjectHandle, TrackedObjectInfo,
};
use crate::range::MemoryRange;
use crate::region::RegionTree;

/// Page-protection capability, wrapping the host's protection primitive
/// (`mprotect`, `VirtualProtect`, ...). Synchronous and assumed
/// non-reentrant; the tracker never calls it redundantly for an unchanged
/// protection state.
pub trait MemoryProtection {
    fn set_memory_access(&mut self, range: MemoryRange, access: AccessFlags);
}

impl<T: MemoryProtection + ?Sized> MemoryProtection for &mut T {
    fn set_memory_access(&mut self, range: MemoryRange, access: AccessFlags) {
        <T as MemoryProtection>::set_memory_access(&mut **self, range, access)
    }
}

/// Cache key forwarding hashing/equality to the pointee's content identity.
struct InfoKey(Arc<dyn TrackedObjectInfo>);

impl PartialEq for InfoKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity_equals(other.0.as_ref())
    }
}

impl Eq for InfoKey {}

impl Hash for InfoKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.identity_hash());
    }
}

/// Running counters, mostly useful for host diagnostics and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackerStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub faults_handled: u64,
    pub faults_unrelated: u64,
    /// Protection syscalls issued by [`MemoryTracker::protect_all`].
    pub protect_calls: u64,
    /// Protection syscalls issued by fault handling.
    pub unprotect_calls: u64,
}

/// Façade over the region tree: owns the tree, a content-addressed weak
/// cache of tracked objects, one factory per object category, and the
/// injected page-protection capability.
///
/// No internal synchronization: every operation here mutates shared state,
/// and a hardware fault can be delivered on a different thread than the one
/// inserting objects. Callers must serialize all calls, either with one
/// global lock around every operation or by funneling fault notifications
/// onto a single designated thread. Integrations that field faults in a
/// POSIX signal handler must defer into a less restricted context first;
/// this code allocates and walks the tree, neither of which is
/// async-signal-safe.
pub struct MemoryTracker<P> {
    protection: P,
    tree: RegionTree,
    factories: BTreeMap<CategoryId, Box<dyn TrackedObjectFactory>>,
    cache: HashMap<InfoKey, Weak<dyn TrackedObject>>,
    stats: TrackerStats,
}

impl<P: MemoryProtection> MemoryTracker<P> {
    pub fn new(protection: P) -> Self {
        Self {
            protection,
            tree: RegionTree::new(),
            factories: BTreeMap::new(),
            cache: HashMap::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Install the factory for `category`. Registration is startup-time
    /// configuration; re-registering replaces the previous factory and is
    /// logged, since it almost always indicates a setup bug.
    pub fn register_factory(
        &mut self,
        category: CategoryId,
        factory: Box<dyn TrackedObjectFactory>,
    ) {
        if self.factories.insert(category, factory).is_some() {
            tracing::warn!(category, "replacing previously registered factory");
        }
    }

    /// Return the tracked object for `info`, building and inserting it if no
    /// live one exists.
    ///
    /// The cache is keyed by the info's content identity, not pointer
    /// identity, and holds objects weakly: while any handle from a previous
    /// call is alive, an equal identity returns that same object without
    /// touching the factory. Once every handle is gone the entry is dead and
    /// the factory runs again.
    pub fn get_or_create(
        &mut self,
        category: CategoryId,
        info: Arc<dyn TrackedObjectInfo>,
    ) -> Result<TrackedObjectHandle> {
        let key = InfoKey(Arc::clone(&info));
        if let Some(existing) = self.cache.get(&key).and_then(Weak::upgrade) {
            self.stats.cache_hits += 1;
            return Ok(existing);
        }

        let factory = self
            .factories
            .get(&category)
            .ok_or(TrackerError::MissingFactory { category })?;
        let object = factory.build(info);
        self.cache.insert(key, Arc::downgrade(&object));
        self.tree.insert_root(category, &object);
        object.on_init();
        self.stats.cache_misses += 1;
        tracing::debug!(category, range = %object.info().range(), "tracked object created");
        Ok(object)
    }

    /// Dispatch a hardware access violation at `addr`.
    ///
    /// Returns `true` if a tracked top-level region covers the address (its
    /// pages are now fully accessible and every affected object has been
    /// notified via `on_unprotect`). Returns `false` for an address this
    /// subsystem does not know about; the caller must then treat the fault
    /// as genuinely unrelated.
    pub fn handle_access_violation(&mut self, addr: u64) -> bool {
        match self.tree.access_violation(addr, &mut self.protection) {
            Some(issued) => {
                self.stats.faults_handled += 1;
                if issued {
                    self.stats.unprotect_calls += 1;
                }
                true
            }
            None => {
                self.stats.faults_unrelated += 1;
                false
            }
        }
    }

    /// Re-arm protection over every top-level region, typically after the
    /// collaborator has resynchronized its cached copies. Regions whose
    /// applied access already matches what their objects require are
    /// skipped. Returns the number of protection calls actually issued.
    pub fn protect_all(&mut self) -> usize {
        let mut issued = 0;
        for id in self.tree.top_level_ids() {
            if self.tree.protect(id, &mut self.protection) {
                issued += 1;
            }
        }
        self.stats.protect_calls += issued as u64;
        issued
    }

    /// Tear down every tracked region, firing `on_remove` once per live
    /// object, and drop all cache entries. The tracker stays usable.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.cache.clear();
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Snapshot of the top-level region spans, for diagnostics.
    pub fn top_level_ranges(&self) -> Vec<MemoryRange> {
        self.tree
            .top_level_ids()
            .into_iter()
            .map(|id| self.tree.range(id))
            .collect()
    }
}

impl<P> Drop for MemoryTracker<P> {
    fn drop(&mut self) {
        self.tree.clear();
    }
}
