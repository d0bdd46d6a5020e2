use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crate::access::AccessFlags;
use crate::object::{CategoryId, TrackedObject, TrackedObjectHandle};
use crate::range::MemoryRange;
use crate::tracker::MemoryProtection;

/// Arena index of a region node.
///
/// Ids are only valid within the tree that issued them and may be recycled
/// after the node is freed; nothing outside the tree holds one across
/// mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionId(u32);

/// One node of the address-range tree.
///
/// Invariants:
/// - A node's range contains every directly attached object's range and every
///   child's range. Growth is applied locally; only the root is
///   unconditionally maximal.
/// - Sibling ranges are disjoint once an insertion completes.
/// - Object buckets hold weak references; the strong handles returned by the
///   tracker are the owning ones.
struct RegionNode {
    range: MemoryRange,
    parent: Option<RegionId>,
    children: Vec<RegionId>,
    objects: BTreeMap<CategoryId, Vec<Weak<dyn TrackedObject>>>,
    /// Combined-view groups over this node's children. Only the removal
    /// bookkeeping exists; no grouping policy builds these yet.
    views: Vec<Vec<RegionId>>,
    /// Access currently applied to the underlying pages. Pages start fully
    /// accessible.
    current_access: AccessFlags,
}

pub(crate) struct RegionTree {
    nodes: Vec<Option<RegionNode>>,
    free: Vec<u32>,
    root: RegionId,
}

impl RegionTree {
    pub(crate) fn new() -> Self {
        let mut tree = RegionTree {
            nodes: Vec::new(),
            free: Vec::new(),
            root: RegionId(0),
        };
        tree.root = tree.alloc(MemoryRange::new(0, u64::MAX), None);
        tree
    }

    fn alloc(&mut self, range: MemoryRange, parent: Option<RegionId>) -> RegionId {
        let node = RegionNode {
            range,
            parent,
            children: Vec::new(),
            objects: BTreeMap::new(),
            views: Vec::new(),
            current_access: AccessFlags::ALL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                RegionId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                RegionId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn node(&self, id: RegionId) -> &RegionNode {
        self.nodes[id.0 as usize].as_ref().expect("stale region id")
    }

    fn node_mut(&mut self, id: RegionId) -> &mut RegionNode {
        self.nodes[id.0 as usize].as_mut().expect("stale region id")
    }

    pub(crate) fn range(&self, id: RegionId) -> MemoryRange {
        self.node(id).range
    }

    pub(crate) fn applied_access(&self, id: RegionId) -> AccessFlags {
        self.node(id).current_access
    }

    pub(crate) fn top_level_ids(&self) -> Vec<RegionId> {
        self.node(self.root).children.clone()
    }

    /// Live node count, root excluded.
    pub(crate) fn region_count(&self) -> usize {
        self.nodes.iter().flatten().count() - 1
    }

    /// Root-level insertion: delegate into an overlapping top-level region,
    /// or open a new one scoped to the object's range.
    pub(crate) fn insert_root(&mut self, category: CategoryId, object: &TrackedObjectHandle) {
        let r = object.info().range();
        let root = self.root;
        let target = self
            .node(root)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).range.overlaps(&r));
        match target {
            Some(child) => self.insert_at(child, category, object),
            None => {
                let child = self.alloc(r, Some(root));
                self.node_mut(root).children.push(child);
                self.insert_at(child, category, object);
            }
        }
    }

    pub(crate) fn insert_at(
        &mut self,
        id: RegionId,
        category: CategoryId,
        object: &TrackedObjectHandle,
    ) {
        let r = object.info().range();

        if r == self.node(id).range {
            self.attach(id, category, object);
            return;
        }

        if !self.node(id).range.contains_range(&r) {
            // The object sticks out: grow this region and evict any sibling
            // the grown range now overlaps. The evicted siblings' live
            // objects re-enter through the normal insertion path so they land
            // inside the grown region instead of being dropped.
            let grown = self.node(id).range.merge(&r);
            self.node_mut(id).range = grown;
            tracing::trace!(range = %grown, "region grown");

            let mut relocated = Vec::new();
            if let Some(parent) = self.node(id).parent {
                loop {
                    let grown = self.node(id).range;
                    let victim = self
                        .node(parent)
                        .children
                        .iter()
                        .copied()
                        .find(|&c| c != id && self.node(c).range.overlaps(&grown));
                    match victim {
                        Some(victim) => {
                            relocated.extend(self.remove_child_evicting(parent, victim))
                        }
                        None => break,
                    }
                }
            }
            for (cat, obj) in relocated {
                self.insert_at(id, cat, &obj);
            }
        }

        let delegate = self
            .node(id)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).range.overlaps(&r));
        if let Some(child) = delegate {
            return self.insert_at(child, category, object);
        }

        let child = self.alloc(r, Some(id));
        self.node_mut(id).children.push(child);
        self.attach(child, category, object);
    }

    fn attach(&mut self, id: RegionId, category: CategoryId, object: &TrackedObjectHandle) {
        let bucket = self.node_mut(id).objects.entry(category).or_default();
        bucket.retain(|w| w.strong_count() > 0);
        bucket.push(Arc::downgrade(object));
        if object.wants_combined_view() {
            // No grouping policy exists yet; the object is attached like any
            // other and the opt-in is only logged.
            tracing::trace!(range = %object.info().range(), "combined-view grouping unimplemented");
        }
    }

    /// Access kinds that must trap anywhere inside this region: the OR of
    /// every live attached object's requirement and every child's, with an
    /// early exit once the strongest possible set is reached.
    pub(crate) fn requires_protection(&self, id: RegionId) -> AccessFlags {
        let mut acc = AccessFlags::empty();
        let node = self.node(id);
        for bucket in node.objects.values() {
            for weak in bucket {
                if let Some(obj) = weak.upgrade() {
                    acc |= obj.requires_protection();
                    if acc == AccessFlags::ALL {
                        return acc;
                    }
                }
            }
        }
        for &child in &node.children {
            acc |= self.requires_protection(child);
            if acc == AccessFlags::ALL {
                return acc;
            }
        }
        acc
    }

    /// Apply the protection the attached objects require. Returns whether the
    /// capability was actually invoked; a repeat call with no intervening
    /// state change is a no-op.
    pub(crate) fn protect(&mut self, id: RegionId, cap: &mut dyn MemoryProtection) -> bool {
        let target = !self.requires_protection(id);
        let node = self.node_mut(id);
        if node.current_access == target {
            return false;
        }
        let range = node.range;
        node.current_access = target;
        tracing::trace!(range = %range, access = ?target, "protect region");
        cap.set_memory_access(range, target);
        true
    }

    /// Restore full access and notify the subtree. Returns whether the
    /// capability was invoked.
    pub(crate) fn unprotect(&mut self, id: RegionId, cap: &mut dyn MemoryProtection) -> bool {
        if self.node(id).current_access == AccessFlags::ALL {
            return false;
        }
        let range = self.node(id).range;
        self.node_mut(id).current_access = AccessFlags::ALL;
        tracing::trace!(range = %range, "unprotect region");
        cap.set_memory_access(range, AccessFlags::ALL);
        self.notify_unprotect(id);
        true
    }

    /// Propagate the unprotect notification: every live object's
    /// `on_unprotect` hook, then every child, unconditionally. Cached access
    /// below the notified node is left untouched; only top-level regions are
    /// protect/unprotect targets.
    fn notify_unprotect(&mut self, id: RegionId) {
        let mut live: Vec<TrackedObjectHandle> = Vec::new();
        for bucket in self.node_mut(id).objects.values_mut() {
            bucket.retain(|w| w.strong_count() > 0);
            live.extend(bucket.iter().filter_map(Weak::upgrade));
        }
        for obj in live {
            obj.on_unprotect();
        }
        let children = self.node(id).children.clone();
        for child in children {
            self.notify_unprotect(child);
        }
    }

    /// Fault dispatch: scan top-level regions only. Each top-level range
    /// encloses all of its descendants' ranges, so restoring full access
    /// there also unblocks every descendant's backing pages.
    ///
    /// Returns `None` for an address no tracked region covers, otherwise
    /// whether the capability was invoked.
    pub(crate) fn access_violation(
        &mut self,
        addr: u64,
        cap: &mut dyn MemoryProtection,
    ) -> Option<bool> {
        let root = self.root;
        let hit = self
            .node(root)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).range.contains(addr));
        let region = hit?;
        tracing::debug!(
            addr,
            range = %self.node(region).range,
            "access violation in tracked region"
        );
        Some(self.unprotect(region, cap))
    }

    /// Remove `child` from `parent` because a grown sibling swallowed its
    /// span. Strips every combined-view reference to the child first (a
    /// reference to a removed region must never be followed), then frees the
    /// subtree, returning its live objects for re-insertion. The objects are
    /// relocated, not removed, so `on_remove` does not fire here.
    fn remove_child_evicting(
        &mut self,
        parent: RegionId,
        child: RegionId,
    ) -> Vec<(CategoryId, TrackedObjectHandle)> {
        self.strip_views(parent, child);
        self.node_mut(parent).children.retain(|&c| c != child);
        let mut collected = Vec::new();
        self.collect_and_free(child, &mut collected);
        collected
    }

    fn strip_views(&mut self, parent: RegionId, removed: RegionId) {
        let node = self.node_mut(parent);
        for group in &mut node.views {
            group.retain(|&member| member != removed);
        }
        node.views.retain(|group| !group.is_empty());
    }

    fn collect_and_free(
        &mut self,
        id: RegionId,
        out: &mut Vec<(CategoryId, TrackedObjectHandle)>,
    ) {
        let node = self.nodes[id.0 as usize].take().expect("stale region id");
        self.free.push(id.0);
        for (category, bucket) in node.objects {
            out.extend(bucket.iter().filter_map(Weak::upgrade).map(|o| (category, o)));
        }
        for child in node.children {
            self.collect_and_free(child, out);
        }
    }

    /// Destroy a subtree: `on_remove` fires once for every live object, then
    /// children are torn down recursively.
    fn teardown(&mut self, id: RegionId) {
        let node = self.nodes[id.0 as usize].take().expect("stale region id");
        self.free.push(id.0);
        for bucket in node.objects.values() {
            for obj in bucket.iter().filter_map(Weak::upgrade) {
                obj.on_remove();
            }
        }
        for child in node.children {
            self.teardown(child);
        }
    }

    /// Tear down every top-level region. The tree stays usable.
    pub(crate) fn clear(&mut self) {
        let root = self.root;
        let children = std::mem::take(&mut self.node_mut(root).children);
        for child in children {
            self.teardown(child);
        }
    }

    #[cfg(test)]
    pub(crate) fn add_combined_view(&mut self, parent: RegionId, members: Vec<RegionId>) {
        self.node_mut(parent).views.push(members);
    }

    #[cfg(test)]
    pub(crate) fn views(&self, id: RegionId) -> &[Vec<RegionId>] {
        &self.node(id).views
    }

    #[cfg(test)]
    pub(crate) fn children(&self, id: RegionId) -> Vec<RegionId> {
        self.node(id).children.clone()
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.check_node(self.root);
    }

    #[cfg(test)]
    fn check_node(&self, id: RegionId) {
        let node = self.node(id);
        for (i, &a) in node.children.iter().enumerate() {
            assert!(
                node.range.contains_range(&self.node(a).range),
                "child {} escapes parent {}",
                self.node(a).range,
                node.range
            );
            for &b in &node.children[i + 1..] {
                assert!(
                    !self.node(a).range.overlaps(&self.node(b).range),
                    "siblings {} and {} overlap",
                    self.node(a).range,
                    self.node(b).range
                );
            }
        }
        for bucket in node.objects.values() {
            for obj in bucket.iter().filter_map(Weak::upgrade) {
                assert!(
                    node.range.contains_range(&obj.info().range()),
                    "object {} escapes region {}",
                    obj.info().range(),
                    node.range
                );
            }
        }
        for &child in &node.children {
            self.check_node(child);
        }
    }
}
