use std::any::Any;
use std::sync::Arc;

use crate::access::AccessFlags;
use crate::range::MemoryRange;

/// Small integer distinguishing kinds of tracked objects (textures, render
/// targets, ...). Each category has its own [`TrackedObjectFactory`].
pub type CategoryId = u8;

/// Immutable description of a trackable resource.
///
/// An info value doubles as the resource's spatial footprint ([`range`]) and
/// as the identity key of the tracker's object cache ([`identity_hash`] /
/// [`identity_equals`]). It must never change after creation; the cache
/// relies on both staying stable.
///
/// [`range`]: TrackedObjectInfo::range
/// [`identity_hash`]: TrackedObjectInfo::identity_hash
/// [`identity_equals`]: TrackedObjectInfo::identity_equals
pub trait TrackedObjectInfo {
    /// Guest address span backing the resource.
    fn range(&self) -> MemoryRange;

    /// Stable content hash of the identity. Equal values (per
    /// [`TrackedObjectInfo::identity_equals`]) must hash equally.
    fn identity_hash(&self) -> u64;

    /// Value equality against another info, typically via
    /// [`TrackedObjectInfo::as_any`] downcasting. Infos of different concrete
    /// types compare unequal.
    fn identity_equals(&self, other: &dyn TrackedObjectInfo) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// A collaborator-defined resource whose backing guest memory is monitored.
///
/// Hooks take `&self`: objects are handed out as shared [`TrackedObjectHandle`]s
/// and implementations use interior mutability where they need state. Hook
/// implementations must not panic across the boundary; the tracker does not
/// catch unwinds.
pub trait TrackedObject {
    /// The info this object was built from.
    fn info(&self) -> &dyn TrackedObjectInfo;

    /// Access kinds that must trap while the object's cached derived state is
    /// valid (e.g. [`AccessFlags::WRITE`] to catch writes that would
    /// invalidate a cached GPU copy).
    fn requires_protection(&self) -> AccessFlags;

    /// Whether the object wants to participate in a combined view. Grouping
    /// is currently a stub; the flag is recorded but never acted on.
    fn wants_combined_view(&self) -> bool {
        false
    }

    /// Called once after the object has been attached to the region tree.
    fn on_init(&self) {}

    /// Called once when the region holding the object is torn down.
    fn on_remove(&self) {}

    /// Called whenever the object's region transitions to full access. Must
    /// perform whatever synchronization the object needs before raw guest
    /// access resumes (e.g. flush a cached copy back into guest memory).
    fn on_unprotect(&self) {}
}

/// Shared handle to a tracked object.
///
/// The handles returned by the tracker are the *owning* references: the
/// region tree and the identity cache only observe objects weakly. Dropping
/// every handle destroys the object and a later lookup with an equal identity
/// rebuilds it through the factory.
pub type TrackedObjectHandle = Arc<dyn TrackedObject>;

/// Builds tracked objects for one category id.
pub trait TrackedObjectFactory {
    fn build(&self, info: Arc<dyn TrackedObjectInfo>) -> TrackedObjectHandle;
}
